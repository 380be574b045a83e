//! Caller-facing error codes for session operations.

/// Errors surfaced to the embedding host. Everything that goes wrong before
/// or during a session collapses into one of these two codes; the details are
/// logged at the fault site.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Malformed caller input, unknown participant, concurrent-session
    /// conflict, or an internal fault.
    #[error("invalid parameters")]
    InvalidParams,
    /// The session deadline fired before the engine produced its result.
    #[error("timeout exceeded")]
    TimeoutExceeded,
}

impl SessionError {
    /// Stable integer sentinel for foreign boundaries.
    pub fn code(&self) -> u8 {
        match self {
            SessionError::InvalidParams => 0,
            SessionError::TimeoutExceeded => 1,
        }
    }
}

/// Terminal outcome of a session: an opaque result blob (save-data for
/// keygen, signature-data for sign) or an error code.
pub type SessionOutcome = Result<Vec<u8>, SessionError>;
