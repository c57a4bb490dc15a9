use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;
use crate::slots;

use super::EngineError;
use super::ledger::{DayLedger, RequesterState};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_requester(requester: &str) -> Result<(), EngineError> {
    if requester.is_empty() {
        return Err(EngineError::LimitExceeded("requester id is empty"));
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::LimitExceeded("requester id too long"));
    }
    Ok(())
}

pub(crate) fn validate_resource(resource: &Resource) -> Result<(), EngineError> {
    if let Some(ref n) = resource.name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
    if resource.windows.len() > MAX_WINDOWS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("too many working windows"));
    }
    for w in &resource.windows {
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&w.slot_minutes) {
            return Err(EngineError::InvalidWindow("slot duration out of range"));
        }
        w.window().validate()?;
    }

    // Slots of one day must not overlap, so neither may its windows.
    let mut by_day: Vec<&WorkingWindow> = resource.windows.iter().collect();
    by_day.sort_by_key(|w| (w.weekday.num_days_from_monday(), w.start));
    for pair in by_day.windows(2) {
        if pair[0].weekday == pair[1].weekday && pair[1].start < pair[0].end {
            return Err(EngineError::InvalidWindow("working windows overlap"));
        }
    }
    Ok(())
}

/// (a) The span must be one the resource's working windows generate for `date`.
pub(crate) fn check_slot_offered(
    resource: &Resource,
    date: NaiveDate,
    span: &Span,
) -> Result<(), EngineError> {
    if slots::offers(resource, date, span) {
        Ok(())
    } else {
        Err(EngineError::InvalidSlot {
            resource_id: resource.id,
            date,
            span: *span,
        })
    }
}

/// (b) No scheduled booking may occupy the span. Caller holds the ledger's write lock.
pub(crate) fn check_slot_free(ledger: &DayLedger, span: &Span) -> Result<(), EngineError> {
    match ledger.occupant(span) {
        Some(existing) => Err(EngineError::SlotTaken {
            booking_id: existing.id,
            date: ledger.key.1,
            span: *span,
        }),
        None => Ok(()),
    }
}

/// (c) The requester must be under their cap of scheduled bookings.
pub(crate) fn check_requester_cap(
    state: &RequesterState,
    requester: &str,
    default_cap: u32,
) -> Result<(), EngineError> {
    let cap = state.effective_cap(default_cap);
    let active = state.active.len();
    if active >= cap as usize {
        return Err(EngineError::RequesterLimitExceeded {
            requester: requester.to_string(),
            active,
            cap,
        });
    }
    Ok(())
}
