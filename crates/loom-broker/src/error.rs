use thiserror::Error;

/// Errors surfaced by any [`crate::Broker`] implementation.
///
/// Both backends (the real Redis-backed one and the in-memory fake) map
/// their own failure modes onto this single enum so callers never match on
/// backend-specific types.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or the connection was rejected.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// A broker command completed but reported a failure (e.g. a malformed
    /// reply, or a group that already exists with `create_if_missing=false`).
    #[error("broker command failed: {0}")]
    Command(String),

    /// A stream/hash field could not be decoded as UTF-8 text.
    #[error("broker reply was not valid text: {0}")]
    Encoding(String),
}
