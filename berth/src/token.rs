//! Affinity token: the identifier correlating work items to a shared context.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier correlating multiple work items to one shared context.
///
/// Tokens are compared by exact string match. A work item that carries no
/// token is represented as `Option::<AffinityToken>::None` at every API
/// boundary: absent is a distinct case that never collides with any concrete
/// token, and unaffiliated work items never share a slot with each other.
///
/// The on-the-wire representation of the token (header name, encoding) is
/// the transport's concern; by the time a token reaches this crate it is
/// just a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffinityToken(String);

impl AffinityToken {
    /// Create a token from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// View the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AffinityToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AffinityToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}
