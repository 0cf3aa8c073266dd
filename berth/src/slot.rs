//! Rendezvous slot: per-token state machine for sharing one context.
//!
//! A `RendezvousSlot` is the unit of coordination behind a single affinity
//! token. It carries the busy count, the (possibly not-yet-existing) shared
//! context, the set of callers parked waiting for creation to finish, and
//! the idle-notification hook the external runtime uses to arbitrate
//! teardown.
//!
//! # Phase Machine
//!
//! ```text
//! Pending ──install──▶ Ready ──close──▶ Closing
//!    │                                     ▲
//!    └───────fail / creator dropped────────┘
//! ```
//!
//! # Rendezvous
//!
//! ```text
//! Creator                         Follower(s)
//! ───────                         ───────────
//! reserve (busy += 1)             try_acquire (busy += 1)
//! build context (no locks held)   await_context → park on oneshot
//! install(context)  ────────────▶ released with Arc<C>
//! ...work...                      ...work...
//! lease.complete() (busy -= 1)    lease.complete() (busy -= 1)
//!                                 busy == 0 → idle callback fires
//! ```
//!
//! The slot's own lock is only ever held for field updates, never across
//! waiting or context construction.

use crate::config::RegistryConfig;
use crate::error::AffinityError;
use crate::token::AffinityToken;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Callback registered by the external runtime, invoked once on the next
/// transition to idle.
pub type IdleCallback = Box<dyn FnOnce() + Send + 'static>;

/// Observable phase of a rendezvous slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotPhase {
    /// No context yet; the creator is in flight and waiters park.
    Pending,
    /// Context installed and servable.
    Ready,
    /// Removed from the registry (or creation failed); draining.
    Closing,
}

type WaitResult<C> = Result<Arc<C>, AffinityError>;

enum State<C> {
    Pending {
        waiters: Vec<oneshot::Sender<WaitResult<C>>>,
    },
    Ready {
        context: Arc<C>,
    },
    Closing {
        /// Set when the slot closed because creation failed, so late
        /// waiters observe the original failure instead of a bare close.
        error: Option<AffinityError>,
    },
}

struct Inner<C> {
    state: State<C>,
    busy: u32,
    idle_callback: Option<IdleCallback>,
}

/// Verdict of an idle-gated close attempt. See
/// [`RendezvousSlot::close_if_idle`].
pub(crate) enum CloseDecision<C> {
    /// The slot re-acquired work since the idle check; nothing was closed.
    Busy,
    /// The slot is now `Closing`. Carries the installed context, if any,
    /// for the caller to destroy.
    Closed(Option<Arc<C>>),
}

/// Per-token coordination point shared by all work items presenting the
/// same affinity token.
///
/// Slots are created by [`AffinityRegistry::resolve_or_reserve`] and handed
/// out behind `Arc`; the registry map holds one reference and every
/// in-flight [`WorkLease`] holds another.
///
/// [`AffinityRegistry::resolve_or_reserve`]: crate::registry::AffinityRegistry::resolve_or_reserve
pub struct RendezvousSlot<C> {
    token: Option<AffinityToken>,
    inner: Mutex<Inner<C>>,
    config: RegistryConfig,
}

impl<C> RendezvousSlot<C> {
    pub(crate) fn new(token: Option<AffinityToken>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            token,
            inner: Mutex::new(Inner {
                state: State::Pending {
                    waiters: Vec::new(),
                },
                busy: 0,
                idle_callback: None,
            }),
            config,
        })
    }

    /// Token this slot was registered under, `None` for a one-shot slot
    /// serving an unaffiliated work item.
    pub fn token(&self) -> Option<&AffinityToken> {
        self.token.as_ref()
    }

    /// Current phase of the slot.
    pub fn phase(&self) -> SlotPhase {
        match self.inner.lock().state {
            State::Pending { .. } => SlotPhase::Pending,
            State::Ready { .. } => SlotPhase::Ready,
            State::Closing { .. } => SlotPhase::Closing,
        }
    }

    /// Number of work items currently referencing this slot.
    pub fn busy_count(&self) -> u32 {
        self.inner.lock().busy
    }

    /// True iff no work item references the slot and it is not draining.
    ///
    /// Idle is necessary but not sufficient for teardown: a new work item
    /// may acquire the slot at any moment, so the runtime re-validates
    /// under the registry lock before destroying anything.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.busy == 0 && !matches!(inner.state, State::Closing { .. })
    }

    /// Acquire a busy-count lease, unless the slot is draining.
    ///
    /// Returns `None` when the slot is `Closing`; callers then resolve the
    /// token again to obtain a fresh slot.
    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkLease<C>> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Closing { .. }) {
            return None;
        }
        inner.busy += 1;
        Some(WorkLease::new(Arc::clone(self)))
    }

    /// Unconditional acquisition for a freshly created slot, taken before
    /// the registry lock is released so the slot can never be observed idle
    /// between reservation and first use.
    pub(crate) fn reserve(self: &Arc<Self>) -> WorkLease<C> {
        let mut inner = self.inner.lock();
        debug_assert!(
            !matches!(inner.state, State::Closing { .. }),
            "reserve on a closing slot"
        );
        inner.busy += 1;
        WorkLease::new(Arc::clone(self))
    }

    /// Wait for the shared context.
    ///
    /// Returns immediately when the context is installed; parks the caller
    /// otherwise. Every waiter is released by exactly one of: the creator
    /// installing a context (all observe the same `Arc`), the creation
    /// failing, or the slot closing.
    pub async fn await_context(&self) -> Result<Arc<C>, AffinityError> {
        let rx = {
            let mut inner = self.inner.lock();
            match &mut inner.state {
                State::Ready { context } => return Ok(Arc::clone(context)),
                State::Closing { error } => {
                    return Err(error.clone().unwrap_or(AffinityError::SlotClosing {
                        token: self.token.clone(),
                    }))
                }
                State::Pending { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        self.park(rx).await
    }

    async fn park(&self, mut rx: oneshot::Receiver<WaitResult<C>>) -> WaitResult<C> {
        if let Some(threshold) = self.config.slow_creation_warning {
            match tokio::time::timeout(threshold, &mut rx).await {
                Ok(outcome) => return self.unpark(outcome),
                Err(_) => {
                    tracing::warn!(
                        token = ?self.token,
                        ?threshold,
                        "context creation still pending past warning threshold"
                    );
                }
            }
        }
        let outcome = rx.await;
        self.unpark(outcome)
    }

    fn unpark(&self, outcome: Result<WaitResult<C>, oneshot::error::RecvError>) -> WaitResult<C> {
        // A dropped sender means the slot vanished without resolving; the
        // installer's drop guard makes this unreachable in practice.
        outcome.unwrap_or_else(|_| {
            Err(AffinityError::CreationFailed {
                token: self.token.clone(),
                reason: "slot dropped before the rendezvous resolved".to_string(),
            })
        })
    }

    /// Install the shared context, transitioning `Pending → Ready` and
    /// releasing every parked waiter with the same `Arc`.
    ///
    /// Callable exactly once, by the creator. A second call is rejected
    /// with [`AffinityError::AlreadyInstalled`] and the first context is
    /// kept.
    pub(crate) fn install(&self, context: C) -> Result<Arc<C>, AffinityError> {
        let context = Arc::new(context);
        let waiters = {
            let mut inner = self.inner.lock();
            match &mut inner.state {
                State::Ready { .. } => {
                    return Err(AffinityError::AlreadyInstalled {
                        token: self.token.clone(),
                    })
                }
                State::Closing { .. } => {
                    return Err(AffinityError::SlotClosing {
                        token: self.token.clone(),
                    })
                }
                State::Pending { waiters } => {
                    let waiters = std::mem::take(waiters);
                    inner.state = State::Ready {
                        context: Arc::clone(&context),
                    };
                    waiters
                }
            }
        };
        tracing::debug!(
            token = ?self.token,
            released = waiters.len(),
            "shared context installed"
        );
        for waiter in waiters {
            // A failed send means the waiter gave up; that is its business.
            let _ = waiter.send(Ok(Arc::clone(&context)));
        }
        Ok(context)
    }

    /// Close the slot because creation failed, releasing every parked
    /// waiter with `error`. No-op once the slot is Ready or Closing.
    pub(crate) fn fail_waiters(&self, error: AffinityError) {
        let waiters = {
            let mut inner = self.inner.lock();
            match &mut inner.state {
                State::Pending { waiters } => {
                    let waiters = std::mem::take(waiters);
                    inner.state = State::Closing {
                        error: Some(error.clone()),
                    };
                    waiters
                }
                State::Ready { .. } | State::Closing { .. } => {
                    tracing::warn!(
                        token = ?self.token,
                        "fail_waiters on a slot that is not pending"
                    );
                    return;
                }
            }
        };
        tracing::debug!(
            token = ?self.token,
            released = waiters.len(),
            %error,
            "creation failed, releasing waiters"
        );
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Unconditionally transition to `Closing`, regardless of busy count.
    ///
    /// Returns the installed context, if any, so the caller can hand it to
    /// the runtime for destruction. Parked waiters (only possible while
    /// Pending) are released with [`AffinityError::SlotClosing`].
    pub(crate) fn close(&self) -> Option<Arc<C>> {
        let (context, waiters) = {
            let mut inner = self.inner.lock();
            match std::mem::replace(&mut inner.state, State::Closing { error: None }) {
                State::Ready { context } => (Some(context), Vec::new()),
                State::Pending { waiters } => (None, waiters),
                State::Closing { error } => {
                    inner.state = State::Closing { error };
                    (None, Vec::new())
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(AffinityError::SlotClosing {
                token: self.token.clone(),
            }));
        }
        context
    }

    /// Atomically re-validate idleness and close.
    ///
    /// This is the teardown re-check: the busy test and the transition to
    /// `Closing` happen under one slot-lock acquisition, so no new lease
    /// can slip in between them.
    pub(crate) fn close_if_idle(&self) -> CloseDecision<C> {
        let mut inner = self.inner.lock();
        if inner.busy > 0 {
            return CloseDecision::Busy;
        }
        match std::mem::replace(&mut inner.state, State::Closing { error: None }) {
            State::Ready { context } => CloseDecision::Closed(Some(context)),
            // A pending slot always carries the creator's lease, so an idle
            // pending slot only exists transiently during a failed-creation
            // race; there is nothing to destroy either way.
            State::Pending { waiters } => {
                drop(inner);
                for waiter in waiters {
                    let _ = waiter.send(Err(AffinityError::SlotClosing {
                        token: self.token.clone(),
                    }));
                }
                CloseDecision::Closed(None)
            }
            State::Closing { error } => {
                inner.state = State::Closing { error };
                CloseDecision::Closed(None)
            }
        }
    }

    /// Register a callback to fire on the *next* transition to idle.
    ///
    /// If the slot is already idle the callback is stored, not invoked:
    /// the runtime re-checks [`is_idle`](Self::is_idle) after registering,
    /// and always re-validates inside the teardown path, so nothing is
    /// lost. At most one callback is pending at a time; registering again
    /// replaces the previous one.
    pub fn register_idle_callback(&self, callback: IdleCallback) {
        let mut inner = self.inner.lock();
        if inner.idle_callback.replace(callback).is_some() {
            tracing::debug!(token = ?self.token, "idle callback replaced");
        }
    }

    fn decrement_busy(&self) {
        let fired = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.busy > 0, "busy count underflow");
            inner.busy = inner.busy.saturating_sub(1);
            if inner.busy == 0 {
                inner.idle_callback.take()
            } else {
                None
            }
        };
        if let Some(callback) = fired {
            tracing::debug!(token = ?self.token, "slot idle, invoking idle callback");
            // Outside the slot lock: the runtime's callback may call back
            // into the registry.
            callback();
        }
    }
}

/// RAII bracket around one work item's reference to a slot.
///
/// The busy count was incremented when the lease was issued; calling
/// [`complete`](Self::complete) (or dropping the lease) decrements it
/// exactly once, after the work item is fully finished, including any
/// response still in flight. Completion is idempotent, so an explicit
/// `complete()` followed by the drop cannot double-release.
///
/// Completing a lease whose slot has already been removed from the
/// registry is benign: the count still drains to zero and nobody is
/// listening.
pub struct WorkLease<C> {
    slot: Arc<RendezvousSlot<C>>,
    completed: AtomicBool,
}

impl<C> WorkLease<C> {
    fn new(slot: Arc<RendezvousSlot<C>>) -> Self {
        Self {
            slot,
            completed: AtomicBool::new(false),
        }
    }

    /// The slot this lease holds busy.
    pub fn slot(&self) -> &Arc<RendezvousSlot<C>> {
        &self.slot
    }

    /// Report the work item fully finished, decrementing the busy count.
    ///
    /// Idempotent; the first call wins and later calls (including the
    /// implicit one on drop) are no-ops.
    pub fn complete(&self) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            self.slot.decrement_busy();
        }
    }
}

impl<C> Drop for WorkLease<C> {
    fn drop(&mut self) {
        self.complete();
    }
}
