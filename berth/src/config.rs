//! Shared configuration for the affinity registry.

use std::time::Duration;

/// Configuration applied to every slot created by a registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a waiter parks on a pending slot before logging a warning.
    ///
    /// The rendezvous itself has no timeout: waiters rely on the creator
    /// either installing a context or failing, which releases them. This
    /// threshold only surfaces unusually slow creators in the logs; the
    /// waiter keeps waiting afterwards. `None` disables the warning.
    pub slow_creation_warning: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            // Creation normally takes milliseconds; ten seconds pending
            // means the creator is stuck or the backend is degraded.
            slow_creation_warning: Some(Duration::from_secs(10)),
        }
    }
}

impl RegistryConfig {
    /// Create a config with a custom slow-creation warning threshold.
    pub fn with_slow_creation_warning(threshold: Option<Duration>) -> Self {
        Self {
            slow_creation_warning: threshold,
        }
    }
}
