//! Affinity registry: the token → slot map and its rendezvous protocol.
//!
//! One coarse lock guards the map. The lock is held only for map mutation,
//! never across context creation (arbitrary user code) and never across
//! waiting, so one slow creation cannot stall unrelated tokens.
//!
//! # Arrival Path
//!
//! ```text
//! work item arrives
//!   └─ resolve_or_reserve(token)
//!        ├─ slot exists  → busy += 1, follower: await_context()
//!        └─ no slot      → insert fresh slot, busy += 1,
//!                          creator: build context, installer.install(ctx)
//!                          (all waiters released with the same context)
//! work item finishes
//!   └─ lease.complete()  → busy -= 1; at zero the idle callback fires
//! ```
//!
//! # Teardown Path
//!
//! The external runtime owns the destruction decision. It checks
//! [`AffinityRegistry::is_idle`], optionally parks a callback with
//! [`AffinityRegistry::register_idle_callback`], and commits through
//! [`AffinityRegistry::retire_if_idle`], which re-validates idleness and
//! removes + destroys under the map lock so no lookup can be satisfied by
//! the dying slot.

use crate::config::RegistryConfig;
use crate::error::AffinityError;
use crate::slot::{CloseDecision, IdleCallback, RendezvousSlot, WorkLease};
use crate::token::AffinityToken;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Outcome of a [`AffinityRegistry::retire_if_idle`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetireOutcome {
    /// The slot was idle; it has been removed and the context destroyed.
    Retired,
    /// A work item acquired the slot since the last idle check; nothing
    /// was removed. The runtime defers and asks again later.
    StillBusy,
    /// No slot is registered under the token (already removed).
    NotFound,
}

impl RetireOutcome {
    /// True iff the context was actually torn down.
    pub fn is_retired(&self) -> bool {
        matches!(self, RetireOutcome::Retired)
    }
}

/// Registry mapping affinity tokens to rendezvous slots.
///
/// At most one slot, and therefore at most one shared context, exists per
/// token at any time. Work items without a token get a private one-shot
/// slot that is never entered into the map.
pub struct AffinityRegistry<C> {
    slots: Mutex<HashMap<AffinityToken, Arc<RendezvousSlot<C>>>>,
    config: RegistryConfig,
}

impl<C> Default for AffinityRegistry<C> {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl<C> AffinityRegistry<C> {
    /// Create a registry with the given slot configuration.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Number of live slots (excludes one-shot slots for absent tokens).
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True iff no slot is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Resolve the slot for `token`, or reserve a new one.
    ///
    /// Exactly one of the concurrent callers for a token with no live slot
    /// receives the creator role (its [`Reservation`] carries a
    /// [`ContextInstaller`]); everyone else shares the same slot as a
    /// follower. The returned reservation already holds a busy lease, taken
    /// before the map lock is released, so the slot cannot be concluded
    /// idle between reservation and first use.
    ///
    /// An absent token always yields a fresh one-shot slot with the creator
    /// role; unaffiliated work items never share a context.
    pub fn resolve_or_reserve(
        self: &Arc<Self>,
        token: Option<&AffinityToken>,
    ) -> Reservation<C> {
        let mut slots = self.slots.lock();

        if let Some(token) = token {
            if let Some(slot) = slots.get(token) {
                // A Closing remnant can linger briefly between a creation
                // failure and its removal; treat it as a miss.
                if let Some(lease) = slot.try_acquire() {
                    tracing::debug!(%token, "joined existing slot");
                    return Reservation {
                        slot: Arc::clone(slot),
                        lease,
                        installer: None,
                    };
                }
            }
            let slot = RendezvousSlot::new(Some(token.clone()), self.config.clone());
            slots.insert(token.clone(), Arc::clone(&slot));
            let lease = slot.reserve();
            tracing::debug!(%token, "reserved new slot, caller is creator");
            Reservation {
                slot: Arc::clone(&slot),
                lease,
                installer: Some(ContextInstaller {
                    slot: Some(slot),
                    registry: Arc::downgrade(self),
                }),
            }
        } else {
            let slot = RendezvousSlot::new(None, self.config.clone());
            let lease = slot.reserve();
            tracing::debug!("reserved one-shot slot for unaffiliated work item");
            Reservation {
                slot: Arc::clone(&slot),
                lease,
                installer: Some(ContextInstaller {
                    slot: Some(slot),
                    registry: Arc::downgrade(self),
                }),
            }
        }
    }

    /// Remove the slot for `token`, marking it `Closing`.
    ///
    /// Idempotent: removing an absent token is a no-op. Any later
    /// [`resolve_or_reserve`](Self::resolve_or_reserve) builds a fresh
    /// slot; in-flight leases on the removed slot drain benignly.
    pub fn remove(&self, token: &AffinityToken) {
        let removed = self.slots.lock().remove(token);
        if let Some(slot) = removed {
            slot.close();
            tracing::debug!(%token, "slot removed from registry");
        }
    }

    /// True iff a slot exists for `token` and is idle.
    ///
    /// Returns `false` for an unregistered token. Idle is a snapshot, not
    /// a promise: commit teardown through
    /// [`retire_if_idle`](Self::retire_if_idle), which re-validates.
    pub fn is_idle(&self, token: &AffinityToken) -> bool {
        self.slots
            .lock()
            .get(token)
            .is_some_and(|slot| slot.is_idle())
    }

    /// Park a callback to fire the next time the slot for `token` becomes
    /// idle. Returns `false` when no slot is registered.
    ///
    /// The callback may fire and still lose the race against a new arrival;
    /// the runtime absorbs that by re-validating in
    /// [`retire_if_idle`](Self::retire_if_idle).
    pub fn register_idle_callback(&self, token: &AffinityToken, callback: IdleCallback) -> bool {
        match self.slots.lock().get(token) {
            Some(slot) => {
                slot.register_idle_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Remove `slot`'s map entry only if it is still the one registered
    /// under `token`. A failed creation may race with a retry that already
    /// replaced the entry; the replacement must survive.
    pub(crate) fn remove_if_current(&self, token: &AffinityToken, slot: &Arc<RendezvousSlot<C>>) {
        let mut slots = self.slots.lock();
        if slots
            .get(token)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(token);
            tracing::debug!(%token, "failed slot removed from registry");
        }
    }

    /// Re-validate idleness and, if it holds, remove the slot and destroy
    /// its context, all under the map lock.
    ///
    /// Holding the map lock through `destroy` serializes "slot is being
    /// destroyed" against "slot is being looked up": a concurrent
    /// [`resolve_or_reserve`](Self::resolve_or_reserve) for the same token
    /// finds no slot and creates a fresh one, never the dying one. The
    /// `destroy` hook therefore must not call back into this registry.
    pub fn retire_if_idle(
        &self,
        token: &AffinityToken,
        destroy: impl FnOnce(Arc<C>),
    ) -> RetireOutcome {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get(token) else {
            return RetireOutcome::NotFound;
        };
        match slot.close_if_idle() {
            CloseDecision::Busy => {
                tracing::debug!(%token, "retire declined, slot re-acquired");
                RetireOutcome::StillBusy
            }
            CloseDecision::Closed(context) => {
                slots.remove(token);
                tracing::debug!(%token, "slot retired");
                if let Some(context) = context {
                    destroy(context);
                }
                RetireOutcome::Retired
            }
        }
    }
}

/// Result of [`AffinityRegistry::resolve_or_reserve`]: a slot, a busy
/// lease, and (for the single creator) the installation handshake.
pub struct Reservation<C> {
    slot: Arc<RendezvousSlot<C>>,
    lease: WorkLease<C>,
    installer: Option<ContextInstaller<C>>,
}

impl<C> Reservation<C> {
    /// The slot this reservation is bound to.
    pub fn slot(&self) -> &Arc<RendezvousSlot<C>> {
        &self.slot
    }

    /// True iff this caller was elected creator and must build the context.
    pub fn is_newly_created(&self) -> bool {
        self.installer.is_some()
    }

    /// Take the installation handshake. `Some` exactly once, for the
    /// creator; followers get `None`.
    pub fn take_installer(&mut self) -> Option<ContextInstaller<C>> {
        self.installer.take()
    }

    /// Give up the slot and keep only the busy lease.
    ///
    /// Dropping a reservation whose installer was never taken aborts the
    /// creation (see [`ContextInstaller`]); call this only after the
    /// context is installed or the creator role was taken elsewhere.
    pub fn into_lease(self) -> WorkLease<C> {
        self.lease
    }
}

/// Creator-side handle for finishing a reservation.
///
/// Exactly one of [`install`](Self::install) or [`fail`](Self::fail) should
/// be called. If the installer is dropped without either (the creator
/// panicked or bailed early), the creation is failed on its behalf, so
/// parked waiters are never stranded.
pub struct ContextInstaller<C> {
    slot: Option<Arc<RendezvousSlot<C>>>,
    registry: Weak<AffinityRegistry<C>>,
}

impl<C> ContextInstaller<C> {
    /// Install the freshly built context, releasing all waiters.
    pub fn install(mut self, context: C) -> Result<Arc<C>, AffinityError> {
        // Taking the slot disarms the drop guard.
        match self.slot.take() {
            Some(slot) => slot.install(context),
            None => Err(AffinityError::SlotClosing { token: None }),
        }
    }

    /// Report that creation failed.
    ///
    /// The slot is removed from the registry so the token can be retried,
    /// and every parked waiter receives
    /// [`AffinityError::CreationFailed`] with `reason`. Only callers on
    /// this token observe the failure.
    pub fn fail(mut self, reason: impl Into<String>) {
        if let Some(slot) = self.slot.take() {
            abort_creation(&self.registry, &slot, reason.into());
        }
    }
}

impl<C> Drop for ContextInstaller<C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            abort_creation(
                &self.registry,
                &slot,
                "context creator dropped before installing".to_string(),
            );
        }
    }
}

fn abort_creation<C>(
    registry: &Weak<AffinityRegistry<C>>,
    slot: &Arc<RendezvousSlot<C>>,
    reason: String,
) {
    let token = slot.token().cloned();
    // Fail first so waiters observe CreationFailed rather than a bare
    // close, then drop the map entry so the token can be retried. The
    // removal is pointer-compared: a retry may already have replaced the
    // entry with a fresh slot, which must not be torn down.
    slot.fail_waiters(AffinityError::CreationFailed {
        token: token.clone(),
        reason,
    });
    if let (Some(registry), Some(token)) = (registry.upgrade(), token) {
        registry.remove_if_current(&token, slot);
    }
}
