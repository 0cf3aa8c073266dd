//! Convenience re-exports for the common public surface.

pub use crate::config::RegistryConfig;
pub use crate::dispatch::{Admission, ContextFactory, Dispatcher, WorkItem};
pub use crate::error::AffinityError;
pub use crate::registry::{AffinityRegistry, RetireOutcome};
pub use crate::session::SessionBinding;
pub use crate::slot::{RendezvousSlot, SlotPhase, WorkLease};
pub use crate::token::AffinityToken;
