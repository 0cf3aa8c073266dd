//! Error types for the affinity registry.

use crate::token::AffinityToken;
use thiserror::Error;

/// Errors surfaced by the registry and its rendezvous slots.
///
/// Failures stay local to the token they occurred on: a failed creation is
/// delivered only to the callers waiting on that slot, never to work items
/// sharing the registry under other tokens.
///
/// The enum is `Clone` because a single creation failure fans out to every
/// waiter parked on the slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AffinityError {
    /// `install` was called twice for the same slot.
    ///
    /// This is a programming error in the creator path. The first installed
    /// context is kept; it is never silently overwritten.
    #[error("context already installed for token {token:?}")]
    AlreadyInstalled {
        /// Token of the slot that already holds a context.
        token: Option<AffinityToken>,
    },

    /// The creator failed (or vanished) before installing a context.
    ///
    /// All waiters parked on the slot receive this error and the slot is
    /// removed from the registry, so a later work item for the same token
    /// starts a fresh creation attempt.
    #[error("context creation failed for token {token:?}: {reason}")]
    CreationFailed {
        /// Token of the slot whose creation failed.
        token: Option<AffinityToken>,
        /// Human-readable cause reported by the creator.
        reason: String,
    },

    /// The slot is draining; the operation raced with teardown.
    ///
    /// Callers recover by resolving the token again, which yields a brand
    /// new slot.
    #[error("slot is closing for token {token:?}")]
    SlotClosing {
        /// Token of the slot being torn down.
        token: Option<AffinityToken>,
    },
}

impl AffinityError {
    /// Token the error is scoped to, when known.
    pub fn token(&self) -> Option<&AffinityToken> {
        match self {
            AffinityError::AlreadyInstalled { token }
            | AffinityError::CreationFailed { token, .. }
            | AffinityError::SlotClosing { token } => token.as_ref(),
        }
    }
}
