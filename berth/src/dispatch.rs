//! Dispatcher seam: the inbound work-item path over the registry.
//!
//! The dispatcher owns the two collaborator interfaces the registry is
//! specified against: extracting the affinity token from a work item, and
//! building a context when a caller is elected creator. Transport, encoding,
//! and scheduling stay outside this crate.
//!
//! ```text
//! item ─▶ admit ─▶ session fast path? ──hit──▶ leased slot
//!                        │ miss
//!                        ▼
//!                resolve_or_reserve ─▶ creator? build + install
//!                        │                      │
//!                        ▼                      ▼
//!                  await_context ◀── released with Arc<C>
//!                        │
//!                        ▼
//!             Admission { context, lease }
//! ```

use crate::error::AffinityError;
use crate::registry::AffinityRegistry;
use crate::session::SessionBinding;
use crate::slot::WorkLease;
use crate::token::AffinityToken;
use async_trait::async_trait;
use std::sync::Arc;

/// Inbound unit of work, as far as the registry is concerned.
///
/// The only thing the core reads from a work item is its affinity token;
/// payloads, replies, and routing belong to the transport.
pub trait WorkItem {
    /// The affinity token carried in-band by this item, if any.
    fn affinity_token(&self) -> Option<AffinityToken>;
}

/// Builds the shared execution context for a token.
///
/// Invoked only by the single caller elected creator, with no registry or
/// slot locks held, so creation may be arbitrarily slow without stalling
/// unrelated tokens.
#[async_trait]
pub trait ContextFactory<C>: Send + Sync {
    /// Build a context for `token` (`None` for an unaffiliated item).
    async fn create(
        &self,
        token: Option<&AffinityToken>,
    ) -> Result<C, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl<C, F> ContextFactory<C> for Arc<F>
where
    F: ContextFactory<C> + ?Sized,
{
    async fn create(
        &self,
        token: Option<&AffinityToken>,
    ) -> Result<C, Box<dyn std::error::Error + Send + Sync>> {
        (**self).create(token).await
    }
}

/// A work item admitted against a shared context.
///
/// Holds the context and the busy lease bracketing this item. Call
/// [`complete`](Self::complete) once the item is fully finished, including
/// any response still in flight, or rely on drop as the backstop.
pub struct Admission<C> {
    context: Arc<C>,
    lease: WorkLease<C>,
}

impl<C> Admission<C> {
    /// The shared context this item runs against.
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Close the busy bracket for this work item.
    pub fn complete(self) {
        self.lease.complete();
    }
}

/// Wires work-item arrival to the registry's rendezvous protocol.
pub struct Dispatcher<C, F> {
    registry: Arc<AffinityRegistry<C>>,
    factory: F,
}

impl<C, F> Dispatcher<C, F>
where
    C: Send + Sync + 'static,
    F: ContextFactory<C>,
{
    /// Create a dispatcher over `registry` using `factory` for creation.
    pub fn new(registry: Arc<AffinityRegistry<C>>, factory: F) -> Self {
        Self { registry, factory }
    }

    /// The registry this dispatcher resolves against.
    pub fn registry(&self) -> &Arc<AffinityRegistry<C>> {
        &self.registry
    }

    /// Admit a work item: resolve (or create) its shared context and open
    /// the busy bracket.
    pub async fn admit(&self, item: &impl WorkItem) -> Result<Admission<C>, AffinityError> {
        let token = item.affinity_token();
        self.admit_token(token.as_ref()).await
    }

    /// Admit a work item arriving on a long-lived channel, using the
    /// channel's [`SessionBinding`] as a lookup shortcut.
    ///
    /// On a cache miss (first message, or the cached slot died) the token
    /// path runs as usual and the binding is refreshed for affiliated
    /// items.
    pub async fn admit_bound(
        &self,
        binding: &SessionBinding<C>,
        item: &impl WorkItem,
    ) -> Result<Admission<C>, AffinityError> {
        if let Some(lease) = binding.acquire() {
            let slot = Arc::clone(lease.slot());
            let context = slot.await_context().await?;
            return Ok(Admission { context, lease });
        }

        let token = item.affinity_token();
        let admission = self.admit_token(token.as_ref()).await?;
        if token.is_some() {
            binding.bind(admission.lease.slot());
        }
        Ok(admission)
    }

    async fn admit_token(
        &self,
        token: Option<&AffinityToken>,
    ) -> Result<Admission<C>, AffinityError> {
        let mut reservation = self.registry.resolve_or_reserve(token);

        if let Some(installer) = reservation.take_installer() {
            // Creator: build the context with no locks held.
            match self.factory.create(token).await {
                Ok(context) => {
                    installer.install(context)?;
                }
                Err(cause) => {
                    let reason = cause.to_string();
                    installer.fail(reason.clone());
                    return Err(AffinityError::CreationFailed {
                        token: token.cloned(),
                        reason,
                    });
                }
            }
        }

        let context = reservation.slot().await_context().await?;
        Ok(Admission {
            context,
            lease: reservation.into_lease(),
        })
    }
}
