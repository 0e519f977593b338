use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("cannot delete interviewer {0}: has interviews")]
    HasInterviews(Ulid),
    #[error("unknown or invalid access token")]
    Unauthenticated,
    #[error("this access has already booked an interview")]
    AlreadyBooked,
    #[error("no interviewer is available for the requested slot")]
    NoAvailability,
    #[error("slot taken concurrently by interview {0}")]
    ReservationConflict(Ulid),
    #[error("reservation failed after {0} attempts")]
    ReservationFailed(u32),
    #[error("timed out waiting for interviewer {0}")]
    LockTimeout(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("availability worker failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Stable short name, used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::HasInterviews(_) => "has_interviews",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::AlreadyBooked => "already_booked",
            EngineError::NoAvailability => "no_availability",
            EngineError::ReservationConflict(_) => "reservation_conflict",
            EngineError::ReservationFailed(_) => "reservation_failed",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
            EngineError::Worker(_) => "worker",
        }
    }

    /// Errors caused by the request rather than by the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            EngineError::WalError(_) | EngineError::Worker(_) | EngineError::LockTimeout(_)
        )
    }
}
