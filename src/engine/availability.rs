use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::ledger::DayLedger;

// ── Availability Index ────────────────────────────────────────────

/// Read-side view of which slots are taken, per resource per day.
///
/// Each entry is an immutable set of scheduled spans, swapped wholesale by
/// `publish` while the writer still holds the day ledger's write lock. Readers
/// never wait on a writer: they see the state as of the last committed
/// booking event for that day (refresh-on-write).
#[derive(Default)]
pub struct AvailabilityIndex {
    booked: DashMap<LedgerKey, Arc<BTreeSet<Span>>>,
}

impl AvailabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published set for the ledger's day.
    pub fn publish(&self, ledger: &DayLedger) {
        let spans: BTreeSet<Span> = ledger.scheduled_spans().collect();
        if spans.is_empty() {
            self.booked.remove(&ledger.key);
        } else {
            self.booked.insert(ledger.key, Arc::new(spans));
        }
    }

    pub fn snapshot(&self, resource_id: Ulid, date: NaiveDate) -> Option<Arc<BTreeSet<Span>>> {
        self.booked
            .get(&(resource_id, date))
            .map(|e| e.value().clone())
    }

    /// False iff a scheduled booking occupies `span`.
    pub fn is_free(&self, resource_id: Ulid, date: NaiveDate, span: &Span) -> bool {
        let Some(set) = self.snapshot(resource_id, date) else {
            return true;
        };
        // Only spans starting before span.end can overlap it.
        let upper = Span {
            start: span.end,
            end: span.end,
        };
        !set.range(..upper).any(|booked| booked.end > span.start)
    }

    pub fn booked_slots(&self, resource_id: Ulid, date: NaiveDate) -> BTreeSet<Slot> {
        self.snapshot(resource_id, date)
            .map(|set| {
                set.iter()
                    .map(|span| Slot::new(resource_id, date, *span))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keep only the free slots, preserving order.
    pub fn filter_free(&self, slots: Vec<Slot>) -> Vec<Slot> {
        slots
            .into_iter()
            .filter(|s| self.is_free(s.resource_id, s.date, &s.span))
            .collect()
    }

    pub fn day_count(&self) -> usize {
        self.booked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn ledger_with(rid: Ulid, spans: &[(Span, BookingStatus)]) -> DayLedger {
        let mut ledger = DayLedger::new((rid, day()));
        for (span, status) in spans {
            ledger.insert(Booking {
                id: Ulid::new(),
                slot: Slot::new(rid, day(), *span),
                requester: "r".into(),
                status: *status,
                created_at: 0,
                updated_at: 0,
            });
        }
        ledger
    }

    #[test]
    fn unknown_day_is_free() {
        let index = AvailabilityIndex::new();
        assert!(index.is_free(Ulid::new(), day(), &Span::new(hm(9, 0), hm(9, 20))));
        assert!(index.booked_slots(Ulid::new(), day()).is_empty());
    }

    #[test]
    fn scheduled_slot_is_taken_cancelled_is_not() {
        let rid = Ulid::new();
        let index = AvailabilityIndex::new();
        let a = Span::new(hm(9, 0), hm(9, 20));
        let b = Span::new(hm(9, 20), hm(9, 40));
        index.publish(&ledger_with(
            rid,
            &[(a, BookingStatus::Scheduled), (b, BookingStatus::Cancelled)],
        ));
        assert!(!index.is_free(rid, day(), &a));
        assert!(index.is_free(rid, day(), &b));
        assert_eq!(
            index.booked_slots(rid, day()),
            BTreeSet::from([Slot::new(rid, day(), a)])
        );
    }

    #[test]
    fn adjacent_slots_stay_free() {
        let rid = Ulid::new();
        let index = AvailabilityIndex::new();
        index.publish(&ledger_with(
            rid,
            &[(Span::new(hm(9, 20), hm(9, 40)), BookingStatus::Scheduled)],
        ));
        assert!(index.is_free(rid, day(), &Span::new(hm(9, 0), hm(9, 20))));
        assert!(index.is_free(rid, day(), &Span::new(hm(9, 40), hm(10, 0))));
        assert!(!index.is_free(rid, day(), &Span::new(hm(9, 30), hm(10, 0))));
    }

    #[test]
    fn other_days_and_resources_unaffected() {
        let rid = Ulid::new();
        let index = AvailabilityIndex::new();
        let span = Span::new(hm(9, 0), hm(9, 20));
        index.publish(&ledger_with(rid, &[(span, BookingStatus::Scheduled)]));
        assert!(index.is_free(Ulid::new(), day(), &span));
        assert!(index.is_free(rid, day().succ_opt().unwrap(), &span));
    }

    #[test]
    fn publishing_an_empty_day_drops_it() {
        let rid = Ulid::new();
        let index = AvailabilityIndex::new();
        let span = Span::new(hm(9, 0), hm(9, 20));
        index.publish(&ledger_with(rid, &[(span, BookingStatus::Scheduled)]));
        assert_eq!(index.day_count(), 1);
        index.publish(&ledger_with(rid, &[(span, BookingStatus::Completed)]));
        assert_eq!(index.day_count(), 0);
        assert!(index.is_free(rid, day(), &span));
    }
}
