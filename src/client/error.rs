use std::time::Duration;

use super::headers::{ResponseStatus, SessionId};

/// A failure reported by the RPC stub underneath a primitive.
///
/// The session layer never retries these. They are wrapped and handed back to
/// the caller, who decides whether to try again.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("partition unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("session {0} not found on the server")]
    SessionNotFound(SessionId),
    #[error("internal server error: {0}")]
    Internal(String),
    #[error("server refused the request: {0:?}")]
    Refused(ResponseStatus),
}

/// Every public operation fails with exactly one of these.
///
/// `Transport` and `HandshakeTimeout` are safe to retry on the same session,
/// `SessionExpired` means the session has to be reopened, and
/// `PreconditionFailed` means the object changed underneath the caller and
/// should be re-read before retrying with the new revision.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("cannot route a primitive across zero partitions")]
    InvalidTopology,
    #[error("failed to create session: {0}")]
    CreateFailed(#[source] TransportError),
    #[error("session {0} is closed or expired")]
    SessionExpired(SessionId),
    #[error("watch handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("revision precondition failed")]
    PreconditionFailed,
    #[error("operation cancelled before a response arrived")]
    Cancelled,
}

impl Error {
    /// True for errors that leave the session usable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::HandshakeTimeout(_))
    }
}
