use pds_core::types::ErrorClass;

/// Typed failures a [`crate::DriveClient`] call can return. Named after the
/// examples in the §4.4 classification table rather than transport details,
/// so the Processor never has to pattern-match on HTTP status codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriveError {
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),
    #[error("revision conflict: {0}")]
    RevisionConflict(String),
    #[error("missing node mapping for {0}")]
    MissingNodeMapping(String),
    #[error("client error ({status}): {message}")]
    ClientError { status: u16, message: String },
    #[error("decrypt failure: {0}")]
    DecryptFailure(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("local I/O error: {0}")]
    Io(String),
}

impl DriveError {
    /// Map onto the §4.4 error classification table. This is the only place
    /// that decides how a concrete failure is retried.
    pub fn classify(&self) -> ErrorClass {
        match self {
            DriveError::ConnectionReset(_) | DriveError::Timeout(_) => ErrorClass::TransientNetwork,
            DriveError::ServerError { status, .. } if (500..600).contains(status) => {
                ErrorClass::TransientNetwork
            }
            DriveError::RateLimited { .. } => ErrorClass::RateLimited,
            DriveError::IntegrityMismatch(_) | DriveError::RevisionConflict(_) => {
                ErrorClass::ReuploadNeeded
            }
            DriveError::MissingNodeMapping(_) => ErrorClass::ClientState,
            DriveError::NotFound(_) => ErrorClass::ClientState,
            DriveError::ClientError { .. }
            | DriveError::ServerError { .. }
            | DriveError::DecryptFailure(_) => ErrorClass::Permanent,
            DriveError::Io(_) => ErrorClass::Permanent,
        }
    }
}
