use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("conflict with reserva: {0}")]
    Conflict(Ulid),
    #[error("slot outside opening hours: {hour}:00 for {hours}h")]
    OutsideHours { hour: u32, hours: u32 },
    #[error("slot in the past: {date} {hour}:00")]
    InPast { date: NaiveDate, hour: u32 },
    #[error("slot too far ahead: {0}")]
    TooFarAhead(NaiveDate),
    #[error("cancha {0} is in use: {1}")]
    InUse(Ulid, &'static str),
    #[error("invalid link: {0}")]
    InvalidLink(&'static str),
    #[error("invalid value: {0}")]
    Invalid(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}
