use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Span};

/// Broad failure classes. Callers decide whether to retry from this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller bug. Never retried.
    Validation,
    /// Lost a race for a slot. Retry with a different slot, not the same one.
    Contention,
    /// Request is refused for this caller. Surfaced to the end user.
    Refused,
    /// Engine could not serve the request right now. Safe to retry as-is.
    Unavailable,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid window: {0}")]
    InvalidWindow(&'static str),
    #[error("invalid slot: {span} is not offered by resource {resource_id} on {date}")]
    InvalidSlot {
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
    },
    #[error("slot taken: {span} on {date} is held by booking {booking_id}")]
    SlotTaken {
        booking_id: Ulid,
        date: NaiveDate,
        span: Span,
    },
    #[error("requester {requester} already has {active} scheduled bookings (cap {cap})")]
    RequesterLimitExceeded {
        requester: String,
        active: usize,
        cap: u32,
    },
    #[error("{requester} may not cancel booking {booking_id}")]
    NotAuthorized { booking_id: Ulid, requester: String },
    #[error("booking {booking_id} is {from}, cannot become {to}")]
    InvalidTransition {
        booking_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidWindow(_)
            | EngineError::InvalidSlot { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::NotFound(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::SlotTaken { .. } => ErrorKind::Contention,
            EngineError::RequesterLimitExceeded { .. } | EngineError::NotAuthorized { .. } => {
                ErrorKind::Refused
            }
            EngineError::LockTimeout(_) | EngineError::WalError(_) => ErrorKind::Unavailable,
        }
    }

    /// True when the identical request may succeed later.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    /// Short stable name, used on the wire and as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::InvalidSlot { .. } => "invalid_slot",
            EngineError::SlotTaken { .. } => "slot_taken",
            EngineError::RequesterLimitExceeded { .. } => "requester_limit_exceeded",
            EngineError::NotAuthorized { .. } => "not_authorized",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
