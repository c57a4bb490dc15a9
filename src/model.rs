use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps only.
pub type Ms = i64;

/// Opaque caller-supplied identifier of whoever books (patient, member, ...).
pub type RequesterId = String;

/// Half-open interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// A bookable interval of one resource on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

impl Slot {
    pub fn new(resource_id: Ulid, date: NaiveDate, span: Span) -> Self {
        Self { resource_id, date, span }
    }

    pub fn key(&self) -> LedgerKey {
        (self.resource_id, self.date)
    }
}

/// Bookings are partitioned per resource per calendar day.
pub type LedgerKey = (Ulid, NaiveDate);

/// One recurring block of working time, e.g. Mondays 09:00–12:00 in 20 minute slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingWindow {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub slot_minutes: u32,
}

impl WorkingWindow {
    pub fn new(weekday: Weekday, start: NaiveTime, end: NaiveTime, slot_minutes: u32) -> Self {
        Self { weekday, start, end, slot_minutes }
    }

    pub fn window(&self) -> crate::slots::Window {
        crate::slots::Window {
            start: self.start,
            end: self.end,
            duration: chrono::Duration::minutes(i64::from(self.slot_minutes)),
        }
    }
}

/// A schedulable entity. Immutable for the duration of a scheduling cycle;
/// loading the same id again replaces the windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: Option<String>,
    pub windows: Vec<WorkingWindow>,
}

impl Resource {
    pub fn new(id: Ulid, name: Option<String>, windows: Vec<WorkingWindow>) -> Self {
        Self { id, name, windows }
    }

    pub fn windows_on(&self, weekday: Weekday) -> impl Iterator<Item = &WorkingWindow> {
        self.windows.iter().filter(move |w| w.weekday == weekday)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Scheduled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A reservation of exactly one slot by one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub slot: Slot,
    pub requester: RequesterId,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn occupies(&self, span: &Span) -> bool {
        self.status == BookingStatus::Scheduled && self.slot.span.overlaps(span)
    }
}

/// Who is asking to change a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub requester: RequesterId,
    /// May cancel bookings made by other requesters.
    pub can_override: bool,
}

impl Principal {
    pub fn requester(id: impl Into<RequesterId>) -> Self {
        Self { requester: id.into(), can_override: false }
    }

    pub fn operator(id: impl Into<RequesterId>) -> Self {
        Self { requester: id.into(), can_override: true }
    }

    pub fn may_cancel(&self, booking: &Booking) -> bool {
        self.can_override || self.requester == booking.requester
    }
}

/// Everything the WAL records. Replayed in order to rebuild a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ResourceLoaded {
        resource: Resource,
    },
    /// Also used by compaction to restore bookings in any status.
    BookingReserved {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        slot: Slot,
        requester: RequesterId,
        /// Who cancelled; differs from `requester` on an override.
        by: RequesterId,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        slot: Slot,
        requester: RequesterId,
        at: Ms,
    },
    RequesterCapSet {
        requester: RequesterId,
        cap: u32,
    },
}

impl Event {
    /// Resource the event concerns, if any. Used for notification routing.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ResourceLoaded { resource } => Some(resource.id),
            Event::BookingReserved { booking } => Some(booking.slot.resource_id),
            Event::BookingCancelled { slot, .. } | Event::BookingCompleted { slot, .. } => {
                Some(slot.resource_id)
            }
            Event::RequesterCapSet { .. } => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}
