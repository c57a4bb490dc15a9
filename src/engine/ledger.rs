use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

/// Every booking of one resource on one date, in any status.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub key: LedgerKey,
    /// Sorted by `slot.span.start`.
    pub bookings: Vec<Booking>,
}

impl DayLedger {
    pub fn new(key: LedgerKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by start time.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.slot.span.start <= booking.slot.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps `span`, any status.
    pub fn overlapping(&self, span: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after span.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.slot.span.start < span.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.slot.span.end > span.start)
    }

    /// The scheduled booking occupying `span`, if any.
    pub fn occupant(&self, span: &Span) -> Option<&Booking> {
        self.overlapping(span).find(|b| b.occupies(span))
    }

    pub fn scheduled_spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Scheduled)
            .map(|b| b.slot.span)
    }
}

/// Per-requester booking bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RequesterState {
    /// Overrides the engine-wide default cap.
    pub cap: Option<u32>,
    /// Ids of this requester's scheduled bookings.
    pub active: HashSet<Ulid>,
}

impl RequesterState {
    pub fn effective_cap(&self, default_cap: u32) -> u32 {
        self.cap.unwrap_or(default_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn booking(rid: Ulid, start: (u32, u32), end: (u32, u32), status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            slot: Slot::new(rid, day(), Span::new(hm(start.0, start.1), hm(end.0, end.1))),
            requester: "r".into(),
            status,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn insert_keeps_start_order() {
        let rid = Ulid::new();
        let mut ledger = DayLedger::new((rid, day()));
        ledger.insert(booking(rid, (10, 0), (10, 20), BookingStatus::Scheduled));
        ledger.insert(booking(rid, (9, 0), (9, 20), BookingStatus::Scheduled));
        ledger.insert(booking(rid, (9, 40), (10, 0), BookingStatus::Cancelled));
        let starts: Vec<_> = ledger.bookings.iter().map(|b| b.slot.span.start).collect();
        assert_eq!(starts, vec![hm(9, 0), hm(9, 40), hm(10, 0)]);
    }

    #[test]
    fn cancelled_rebooking_sits_after_original() {
        let rid = Ulid::new();
        let mut ledger = DayLedger::new((rid, day()));
        let first = booking(rid, (9, 0), (9, 20), BookingStatus::Cancelled);
        let second = booking(rid, (9, 0), (9, 20), BookingStatus::Scheduled);
        let (a, b) = (first.id, second.id);
        ledger.insert(first);
        ledger.insert(second);
        assert_eq!(ledger.bookings[0].id, a);
        assert_eq!(ledger.bookings[1].id, b);
        assert_eq!(ledger.occupant(&Span::new(hm(9, 0), hm(9, 20))).map(|b| b.id), Some(b));
    }

    #[test]
    fn overlapping_is_half_open() {
        let rid = Ulid::new();
        let mut ledger = DayLedger::new((rid, day()));
        ledger.insert(booking(rid, (9, 0), (9, 20), BookingStatus::Scheduled));
        ledger.insert(booking(rid, (9, 40), (10, 0), BookingStatus::Scheduled));
        let query = Span::new(hm(9, 20), hm(9, 40));
        assert_eq!(ledger.overlapping(&query).count(), 0);
        let wide = Span::new(hm(9, 10), hm(9, 50));
        assert_eq!(ledger.overlapping(&wide).count(), 2);
    }

    #[test]
    fn terminal_bookings_do_not_occupy() {
        let rid = Ulid::new();
        let mut ledger = DayLedger::new((rid, day()));
        ledger.insert(booking(rid, (9, 0), (9, 20), BookingStatus::Cancelled));
        ledger.insert(booking(rid, (9, 20), (9, 40), BookingStatus::Completed));
        assert!(ledger.occupant(&Span::new(hm(9, 0), hm(9, 20))).is_none());
        assert!(ledger.occupant(&Span::new(hm(9, 20), hm(9, 40))).is_none());
        assert_eq!(ledger.scheduled_spans().count(), 0);
    }

    #[test]
    fn requester_cap_falls_back_to_default() {
        let mut rs = RequesterState::default();
        assert_eq!(rs.effective_cap(3), 3);
        rs.cap = Some(5);
        assert_eq!(rs.effective_cap(3), 5);
    }
}
