//! Session affinity cache: remembers which slot a long-lived channel used.
//!
//! A channel that carries many work items for the same token can skip the
//! registry lookup after its first message by caching the slot it bound to.
//! The binding is a shortcut, never a source of truth: it holds only a
//! `Weak` reference, and an empty, dead, or draining binding simply means
//! "derive the token from the work item instead".

use crate::slot::{RendezvousSlot, WorkLease};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Non-owning per-channel cache of the slot bound on first contact.
///
/// Embed one of these in the session/connection object owned by the
/// transport. All methods are cheap and never fail; a miss falls back to
/// the normal token path.
pub struct SessionBinding<C> {
    slot: Mutex<Option<Weak<RendezvousSlot<C>>>>,
}

impl<C> SessionBinding<C> {
    /// Create an unbound binding.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// True iff a slot is currently cached (it may still be dead).
    pub fn is_bound(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Cache `slot` as this channel's affinity, replacing any previous
    /// binding (e.g. after the old slot was retired).
    pub fn bind(&self, slot: &Arc<RendezvousSlot<C>>) {
        *self.slot.lock() = Some(Arc::downgrade(slot));
    }

    /// Drop the cached slot, if any.
    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    /// Acquire a busy lease through the cached slot.
    ///
    /// Returns `None`, clearing the stale cache, when the binding is
    /// empty, the slot has been dropped, or the slot is draining. The
    /// caller then resolves the token through the registry as usual.
    pub fn acquire(&self) -> Option<WorkLease<C>> {
        let mut cached = self.slot.lock();
        let lease = cached
            .as_ref()
            .and_then(Weak::upgrade)
            .and_then(|slot| slot.try_acquire());
        if lease.is_none() {
            *cached = None;
        }
        lease
    }
}

impl<C> Default for SessionBinding<C> {
    fn default() -> Self {
        Self::new()
    }
}
