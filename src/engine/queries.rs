use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::slots;

use super::{Engine, EngineError, SharedLedger};

impl Engine {
    /// False iff a scheduled booking occupies the slot. Served from the
    /// availability snapshot; never waits on a writer.
    pub fn is_free(&self, resource_id: Ulid, date: NaiveDate, span: &Span) -> bool {
        self.index.is_free(resource_id, date, span)
    }

    pub fn booked_slots(&self, resource_id: Ulid, date: NaiveDate) -> BTreeSet<Slot> {
        self.index.booked_slots(resource_id, date)
    }

    /// Slots the resource offers on `date` that nobody holds. Unknown
    /// resources offer nothing.
    pub fn available_slots(&self, resource_id: Ulid, date: NaiveDate) -> Vec<Slot> {
        match self.get_resource(&resource_id) {
            Some(resource) => self.index.filter_free(slots::slots_for(&resource, date)),
            None => Vec::new(),
        }
    }

    pub fn list_resources(&self) -> Vec<Arc<Resource>> {
        let mut out: Vec<Arc<Resource>> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    fn ledger(&self, key: &LedgerKey) -> Option<SharedLedger> {
        self.ledgers.get(key).map(|e| e.value().clone())
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let key = self
            .get_ledger_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ledger = self.ledger(&key).ok_or(EngineError::NotFound(booking_id))?;
        let guard = self
            .bounded(ledger.read(), || format!("ledger {} {}", key.0, key.1))
            .await?;
        guard
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// All bookings of the resource on `date` in any status, by start time.
    pub async fn bookings_for_resource(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        let key = (resource_id, date);
        let Some(ledger) = self.ledger(&key) else {
            return Ok(vec![]);
        };
        let guard = self
            .bounded(ledger.read(), || format!("ledger {resource_id} {date}"))
            .await?;
        Ok(guard.bookings.clone())
    }

    /// The requester's bookings in any status, oldest slot first.
    pub async fn bookings_for_requester(&self, requester: &str) -> Result<Vec<Booking>, EngineError> {
        let ledgers: Vec<(LedgerKey, SharedLedger)> = self
            .ledgers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut out = Vec::new();
        for (key, ledger) in ledgers {
            let guard = self
                .bounded(ledger.read(), || format!("ledger {} {}", key.0, key.1))
                .await?;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.requester == requester)
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.slot.date, b.slot.span, b.created_at));
        Ok(out)
    }

    /// Number of scheduled bookings the requester currently holds.
    pub async fn active_count(&self, requester: &str) -> Result<usize, EngineError> {
        let Some(rs) = self.requesters.get(requester).map(|e| e.value().clone()) else {
            return Ok(0);
        };
        let guard = self
            .bounded(rs.lock(), || format!("requester {requester}"))
            .await?;
        Ok(guard.active.len())
    }

    /// The cap that applies to `requester` right now.
    pub async fn requester_cap(&self, requester: &str) -> Result<u32, EngineError> {
        let Some(rs) = self.requesters.get(requester).map(|e| e.value().clone()) else {
            return Ok(self.settings.default_cap);
        };
        let guard = self
            .bounded(rs.lock(), || format!("requester {requester}"))
            .await?;
        Ok(guard.effective_cap(self.settings.default_cap))
    }
}
