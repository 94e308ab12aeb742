//! Delivery outcome errors reported by targets

use thiserror::Error;

/// Why a delivery attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network failure, timeout or target unavailable; the entry is retried.
    #[error("Transient delivery error: {0}")]
    Transient(String),

    /// The target rejected the payload; retrying cannot help.
    #[error("Permanent delivery error: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}
