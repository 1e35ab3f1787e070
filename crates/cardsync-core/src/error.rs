//! Error kinds shared by every cardsync crate.
//!
//! The sync transaction never leaves partial state on disk: every fallible
//! operation in this crate and its siblings returns one of these variants,
//! and the transport layer is the only place that turns a variant into an
//! HTTP status and JSON body.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds from the sync protocol's error handling design.
///
/// Each variant corresponds to one of the orthogonal error axes: missing
/// session, schema drift, post-merge divergence, per-user contention,
/// malformed input, unexpected I/O failure, or a transient upstream outage.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid session key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// An empty discovery probe that must be answered by prompting the
    /// client for credentials rather than treated as a hard auth failure.
    #[error("expected auth")]
    ExpectedAuth,

    /// The client's schema-change timestamp does not match the server's;
    /// incremental sync is impossible and a full sync is required.
    #[error("schema lock: {0}")]
    SchemaLock(String),

    /// Post-merge sanity vectors disagree; the sync context was discarded.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another sync transaction is already active for this user.
    #[error("busy")]
    Busy,

    /// Malformed request body, wrong compression, or an operation that
    /// does not apply to the current state-machine state.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Credentials did not match an existing user.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Unexpected I/O or data-corruption failure. Never leaks partial
    /// state; the caller has already rolled back any staged change.
    #[error("internal error: {0}")]
    Internal(String),

    /// The identity gateway (or another external collaborator) is
    /// temporarily unreachable. Existing sessions are unaffected.
    #[error("temporarily unavailable: {0}")]
    Temporary(String),
}

impl Error {
    /// True for errors that a client can reasonably retry without any
    /// change on its part (vs. errors it must resolve first).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Temporary(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Internal(format!("configuration error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_temporary_are_retryable() {
        assert!(Error::Busy.is_retryable());
        assert!(Error::Temporary("gateway down".into()).is_retryable());
    }

    #[test]
    fn other_kinds_are_not_retryable() {
        assert!(!Error::Unauthorized("no session".into()).is_retryable());
        assert!(!Error::Conflict("sanity mismatch".into()).is_retryable());
        assert!(!Error::BadRequest("bad body".into()).is_retryable());
    }

    #[test]
    fn io_error_converts_to_internal() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
