//! # Berth
//!
//! Affinity registry for correlating streams of independent work items with
//! a single shared, lazily created execution context.
//!
//! Each work item may carry an opaque *affinity token* (a session id from
//! the transport, or an explicit correlation id). All concurrent items
//! presenting the same token rendezvous on one context: exactly one caller
//! is elected creator while the rest wait for, and then share, the context
//! it installs. Busy/idle accounting brackets every item so the context is
//! never torn down with work in flight; the destruction decision itself
//! belongs to an external runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ AffinityRegistry        (token → slot, one lock)   │
//! │                                                    │
//! │   ┌──────────────────────────────────────────┐     │
//! │   │ RendezvousSlot    Pending→Ready→Closing  │     │
//! │   │  busy count · waiters · idle callback    │     │
//! │   └──────────────────────────────────────────┘     │
//! └───────▲─────────────────────────────▲──────────────┘
//!         │ admit / complete            │ is_idle / retire_if_idle
//!   Dispatcher (+ SessionBinding)   external runtime
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use berth::prelude::*;
//!
//! let registry = Arc::new(AffinityRegistry::default());
//! let dispatcher = Dispatcher::new(registry.clone(), MyFactory);
//!
//! // Inbound path, per work item:
//! let admission = dispatcher.admit(&item).await?;
//! handle(admission.context()).await;
//! admission.complete();
//!
//! // Runtime teardown path, per context:
//! if registry.retire_if_idle(&token, |ctx| drop(ctx)).is_retired() {
//!     // context destroyed, token free for a fresh slot
//! }
//! ```
//!
//! Out of scope: the transport that produces work items and
//! session ids, the wire encoding of the token, throttling of total
//! contexts, and how the runtime dispatches work into a context.

#![deny(missing_docs)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod prelude;
pub mod registry;
pub mod session;
pub mod slot;
pub mod token;

pub use config::RegistryConfig;
pub use dispatch::{Admission, ContextFactory, Dispatcher, WorkItem};
pub use error::AffinityError;
pub use registry::{AffinityRegistry, ContextInstaller, Reservation, RetireOutcome};
pub use session::SessionBinding;
pub use slot::{IdleCallback, RendezvousSlot, SlotPhase, WorkLease};
pub use token::AffinityToken;
