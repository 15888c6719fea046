//! Backend error type shared by all capability traits.
//!
//! We avoid `std::io::Error` at the capability boundary so callers can
//! distinguish permission failures from transient network failures and make
//! retry decisions without string matching.

use thiserror::Error;

/// Errors surfaced by the hosted data backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Request never reached the backend or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// The backend rejected the request (row-level security, auth).
    #[error("permission denied: {0}")]
    Permission(String),

    /// The query or mutation itself failed.
    #[error("query failed: {0}")]
    Query(String),

    /// Blob storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A subscription channel closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,
}

impl BackendError {
    /// Returns true if the failure is transient and a retry may succeed.
    ///
    /// Permission and query failures are never transient - retrying the same
    /// request yields the same rejection.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ChannelClosed)
    }
}
