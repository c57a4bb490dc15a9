use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// One request line from a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// `requester` is the identity a client session books and cancels as.
    /// Required for clients; operators may act for any requester.
    Hello {
        site: String,
        password: String,
        #[serde(default)]
        requester: Option<RequesterId>,
    },
    LoadResource {
        resource: Resource,
    },
    ListResources,
    Generate {
        start: NaiveTime,
        end: NaiveTime,
        slot_minutes: i64,
    },
    AvailableSlots {
        resource_id: Ulid,
        date: NaiveDate,
    },
    IsFree {
        resource_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    },
    BookedSlots {
        resource_id: Ulid,
        date: NaiveDate,
    },
    Reserve {
        resource_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        requester: RequesterId,
    },
    Cancel {
        booking_id: Ulid,
        requester: RequesterId,
    },
    Complete {
        booking_id: Ulid,
    },
    GetBooking {
        booking_id: Ulid,
    },
    ResourceBookings {
        resource_id: Ulid,
        date: NaiveDate,
    },
    RequesterBookings {
        requester: RequesterId,
    },
    SetRequesterCap {
        requester: RequesterId,
        cap: u32,
    },
    Listen {
        resource_id: Ulid,
    },
    Unlisten {
        resource_id: Ulid,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("start {start} must be before end {end}")]
    EmptySpan { start: NaiveTime, end: NaiveTime },
}

pub fn parse_request(line: &str) -> Result<Request, CommandError> {
    let req: Request = serde_json::from_str(line)?;
    match &req {
        Request::IsFree { start, end, .. } | Request::Reserve { start, end, .. }
            if start >= end =>
        {
            Err(CommandError::EmptySpan {
                start: *start,
                end: *end,
            })
        }
        _ => Ok(req),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

/// One response line. Exactly one of `data` / `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn data<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self {
                ok: true,
                data: Some(v),
                error: None,
            },
            Err(e) => Self::failure("internal", e.to_string(), false),
        }
    }

    pub fn done() -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.into(),
                message: message.into(),
                retryable,
            }),
        }
    }

    pub fn status_label(&self) -> &'static str {
        if self.ok { "ok" } else { "error" }
    }
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        Reply::failure(e.code(), e.to_string(), e.is_retryable())
    }
}

impl From<CommandError> for Reply {
    fn from(e: CommandError) -> Self {
        Reply::failure("bad_request", e.to_string(), false)
    }
}

/// Pushed to connections that LISTEN on a resource.
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub resource_id: Ulid,
    pub event: &'a Event,
}
