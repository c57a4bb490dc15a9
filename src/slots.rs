use chrono::{Datelike, NaiveDate, NaiveTime};

use crate::engine::EngineError;
use crate::model::*;

/// A contiguous stretch of working time cut into fixed-length slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub duration: chrono::Duration,
}

impl Window {
    pub fn new(start: NaiveTime, end: NaiveTime, duration: chrono::Duration) -> Self {
        Self { start, end, duration }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.duration <= chrono::Duration::zero() {
            return Err(EngineError::InvalidWindow("slot duration must be positive"));
        }
        if self.end <= self.start {
            return Err(EngineError::InvalidWindow("window end must be after start"));
        }
        Ok(())
    }
}

/// Lazy sequence of back-to-back slots inside a window. Cloning restarts
/// from the clone point; `generate` again restarts from the window start.
#[derive(Debug, Clone)]
pub struct Slots {
    next: NaiveTime,
    end: NaiveTime,
    duration: chrono::Duration,
    done: bool,
}

impl Iterator for Slots {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        if self.done {
            return None;
        }
        let (slot_end, wrapped) = self.next.overflowing_add_signed(self.duration);
        // A slot may not run past `end` nor past midnight.
        if wrapped != 0 || slot_end > self.end {
            self.done = true;
            return None;
        }
        let span = Span::new(self.next, slot_end);
        self.next = slot_end;
        Some(span)
    }
}

impl std::iter::FusedIterator for Slots {}

/// Cut `window` into `[start, start + duration)` slots. The trailing remainder
/// shorter than `duration` is discarded.
pub fn generate(window: &Window) -> Result<Slots, EngineError> {
    window.validate()?;
    Ok(Slots {
        next: window.start,
        end: window.end,
        duration: window.duration,
        done: false,
    })
}

/// Membership test equivalent to `generate(window)?.any(|s| s == *span)`,
/// without walking the window. Invalid windows contain nothing.
pub fn contains(window: &Window, span: &Span) -> bool {
    if window.validate().is_err() {
        return false;
    }
    let outer = Span { start: window.start, end: window.end };
    if span.start >= span.end || !outer.contains_span(span) {
        return false;
    }
    if span.duration() != window.duration {
        return false;
    }
    let offset = span.start - window.start;
    match (offset.num_nanoseconds(), window.duration.num_nanoseconds()) {
        (Some(off), Some(step)) => off % step == 0,
        _ => false,
    }
}

/// Every slot the resource offers on `date`, ordered by start time.
pub fn slots_for(resource: &Resource, date: NaiveDate) -> Vec<Slot> {
    let mut out: Vec<Slot> = resource
        .windows_on(date.weekday())
        .filter_map(|w| generate(&w.window()).ok())
        .flatten()
        .map(|span| Slot::new(resource.id, date, span))
        .collect();
    out.sort_by_key(|s| s.span);
    out.dedup();
    out
}

/// Whether `span` is one of the slots the resource offers on `date`.
pub fn offers(resource: &Resource, date: NaiveDate, span: &Span) -> bool {
    resource
        .windows_on(date.weekday())
        .any(|w| contains(&w.window(), span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Weekday};
    use proptest::prelude::*;
    use ulid::Ulid;

    fn window(start: NaiveTime, end: NaiveTime, minutes: i64) -> Window {
        Window::new(start, end, Duration::minutes(minutes))
    }

    #[test]
    fn twenty_minute_slots_in_an_hour() {
        let slots: Vec<Span> = generate(&window(hm(9, 0), hm(10, 0), 20)).unwrap().collect();
        assert_eq!(
            slots,
            vec![
                Span::new(hm(9, 0), hm(9, 20)),
                Span::new(hm(9, 20), hm(9, 40)),
                Span::new(hm(9, 40), hm(10, 0)),
            ]
        );
    }

    #[test]
    fn trailing_remainder_is_discarded() {
        let slots: Vec<Span> = generate(&window(hm(9, 0), hm(10, 0), 25)).unwrap().collect();
        assert_eq!(
            slots,
            vec![Span::new(hm(9, 0), hm(9, 25)), Span::new(hm(9, 25), hm(9, 50))]
        );
    }

    #[test]
    fn duration_longer_than_window_yields_nothing() {
        assert_eq!(generate(&window(hm(9, 0), hm(9, 30), 45)).unwrap().count(), 0);
    }

    #[test]
    fn invalid_windows_rejected() {
        assert!(matches!(
            generate(&window(hm(9, 0), hm(10, 0), 0)),
            Err(EngineError::InvalidWindow(_))
        ));
        assert!(matches!(
            generate(&window(hm(9, 0), hm(10, 0), -5)),
            Err(EngineError::InvalidWindow(_))
        ));
        assert!(matches!(
            generate(&window(hm(10, 0), hm(10, 0), 20)),
            Err(EngineError::InvalidWindow(_))
        ));
        assert!(matches!(
            generate(&window(hm(11, 0), hm(10, 0), 20)),
            Err(EngineError::InvalidWindow(_))
        ));
    }

    #[test]
    fn sequence_is_restartable() {
        let w = window(hm(9, 0), hm(10, 0), 20);
        let mut first = generate(&w).unwrap();
        first.next();
        let resumed = first.clone();
        assert_eq!(first.count(), 2);
        assert_eq!(resumed.count(), 2);
        assert_eq!(generate(&w).unwrap().count(), 3);
    }

    #[test]
    fn never_wraps_past_midnight() {
        let late = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
        let slots: Vec<Span> = generate(&window(hm(23, 0), late, 30)).unwrap().collect();
        assert_eq!(slots, vec![Span::new(hm(23, 0), hm(23, 30))]);
    }

    #[test]
    fn contains_matches_grid_only() {
        let w = window(hm(9, 0), hm(10, 0), 20);
        assert!(contains(&w, &Span::new(hm(9, 20), hm(9, 40))));
        assert!(!contains(&w, &Span::new(hm(9, 10), hm(9, 30)))); // off-grid
        assert!(!contains(&w, &Span::new(hm(9, 0), hm(9, 40)))); // wrong length
        assert!(contains(&w, &Span::new(hm(9, 40), hm(10, 0))));
        assert!(!contains(&w, &Span::new(hm(10, 0), hm(10, 20)))); // outside
    }

    #[test]
    fn slots_for_uses_matching_weekday() {
        let rid = Ulid::new();
        let resource = Resource::new(
            rid,
            Some("Dr. A".into()),
            vec![
                WorkingWindow::new(Weekday::Mon, hm(14, 0), hm(15, 0), 30),
                WorkingWindow::new(Weekday::Mon, hm(9, 0), hm(10, 0), 30),
                WorkingWindow::new(Weekday::Tue, hm(9, 0), hm(17, 0), 30),
            ],
        );
        // 2024-01-01 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let slots = slots_for(&resource, monday);
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].span, Span::new(hm(9, 0), hm(9, 30)));
        assert_eq!(slots[3].span, Span::new(hm(14, 30), hm(15, 0)));
        assert!(slots.iter().all(|s| s.resource_id == rid && s.date == monday));

        let sunday = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        assert!(slots_for(&resource, sunday).is_empty());
        assert!(offers(&resource, monday, &Span::new(hm(14, 30), hm(15, 0))));
        assert!(!offers(&resource, sunday, &Span::new(hm(9, 0), hm(9, 30))));
    }

    proptest! {
        #[test]
        fn slots_tile_the_window(start in 0u32..1200, len in 1u32..600, step in 1u32..180) {
            let start_t = NaiveTime::from_num_seconds_from_midnight_opt(start * 60, 0).unwrap();
            let end_min = (start + len).min(24 * 60 - 1);
            prop_assume!(end_min > start);
            let end_t = NaiveTime::from_num_seconds_from_midnight_opt(end_min * 60, 0).unwrap();
            let w = window(start_t, end_t, i64::from(step));

            let slots: Vec<Span> = generate(&w).unwrap().collect();
            let mut cursor = start_t;
            for s in &slots {
                prop_assert_eq!(s.start, cursor);
                prop_assert_eq!(s.duration(), Duration::minutes(i64::from(step)));
                prop_assert!(s.end <= end_t);
                prop_assert!(contains(&w, s));
                cursor = s.end;
            }
            // Whatever is left over is shorter than one slot.
            prop_assert!(end_t - cursor < Duration::minutes(i64::from(step)));
        }
    }
}
