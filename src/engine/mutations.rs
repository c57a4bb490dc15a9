use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_requester_cap, check_slot_free, check_slot_offered, now_ms, validate_requester,
    validate_resource,
};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Load (or reload) a resource definition, starting a new scheduling cycle
    /// for it. Existing bookings are kept.
    pub async fn load_resource(&self, resource: Resource) -> Result<(), EngineError> {
        validate_resource(&resource)?;
        if !self.resources.contains_key(&resource.id)
            && self.resources.len() >= MAX_RESOURCES_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let _gate = self.enter_commit().await?;
        let event = Event::ResourceLoaded {
            resource: resource.clone(),
        };
        self.wal_append(&event).await?;
        info!(
            "loaded resource {} with {} working windows",
            resource.id,
            resource.windows.len()
        );
        let id = resource.id;
        self.resources.insert(id, Arc::new(resource));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Reserve `span` on `resource_id` for `requester`.
    ///
    /// Preconditions are checked in order and the first failure wins:
    /// the slot is offered, the slot is free, the requester is under their cap.
    /// The ledger write lock is held from the free check through the commit,
    /// so of several concurrent calls for one slot exactly one succeeds.
    pub async fn reserve(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
        requester: &str,
    ) -> Result<Booking, EngineError> {
        validate_requester(requester)?;
        let resource = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        check_slot_offered(&resource, date, &span)?;

        let _gate = self.enter_commit().await?;
        let mut ledger = self.lock_ledger((resource_id, date)).await?;
        check_slot_free(&ledger, &span)?;
        if ledger.bookings.len() >= MAX_BOOKINGS_PER_LEDGER {
            return Err(EngineError::LimitExceeded("too many bookings on this day"));
        }

        let mut req = self.lock_requester(requester).await?;
        check_requester_cap(&req, requester, self.settings.default_cap)?;

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            slot: Slot::new(resource_id, date, span),
            requester: requester.to_string(),
            status: BookingStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingReserved {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut ledger, &mut req, &event).await?;
        debug!("reserved {span} on {date} for {requester} as {}", booking.id);
        Ok(booking)
    }

    /// Cancel a scheduled booking. Only its requester or an override holder
    /// may cancel. Cancelling an already cancelled booking returns it unchanged.
    pub async fn cancel(&self, booking_id: Ulid, principal: &Principal) -> Result<Booking, EngineError> {
        let key = self
            .get_ledger_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;

        let _gate = self.enter_commit().await?;
        let mut ledger = self.lock_ledger(key).await?;
        let booking = ledger
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if !principal.may_cancel(&booking) {
            return Err(EngineError::NotAuthorized {
                booking_id,
                requester: principal.requester.clone(),
            });
        }
        if booking.status == BookingStatus::Cancelled {
            return Ok(booking);
        }
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }

        let mut req = self.lock_requester(&booking.requester).await?;
        let event = Event::BookingCancelled {
            id: booking_id,
            slot: booking.slot,
            requester: booking.requester.clone(),
            by: principal.requester.clone(),
            at: now_ms(),
        };
        self.persist_and_apply(&mut ledger, &mut req, &event).await?;
        if principal.requester != booking.requester {
            info!("booking {booking_id} of {} cancelled by {}", booking.requester, principal.requester);
        } else {
            debug!("booking {booking_id} cancelled by its requester");
        }
        ledger
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Mark a scheduled booking as completed (the appointment took place).
    /// Completing an already completed booking returns it unchanged.
    pub async fn complete(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let key = self
            .get_ledger_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;

        let _gate = self.enter_commit().await?;
        let mut ledger = self.lock_ledger(key).await?;
        let booking = ledger
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if booking.status == BookingStatus::Completed {
            return Ok(booking);
        }
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: booking.status,
                to: BookingStatus::Completed,
            });
        }

        let mut req = self.lock_requester(&booking.requester).await?;
        let event = Event::BookingCompleted {
            id: booking_id,
            slot: booking.slot,
            requester: booking.requester.clone(),
            at: now_ms(),
        };
        self.persist_and_apply(&mut ledger, &mut req, &event).await?;
        debug!("booking {booking_id} completed");
        ledger
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Override the default cap for one requester. Lowering a cap below the
    /// requester's current count keeps existing bookings and refuses new ones.
    pub async fn set_requester_cap(&self, requester: &str, cap: u32) -> Result<(), EngineError> {
        validate_requester(requester)?;
        if cap > MAX_REQUESTER_CAP {
            return Err(EngineError::LimitExceeded("requester cap too large"));
        }
        let _gate = self.enter_commit().await?;
        let mut req = self.lock_requester(requester).await?;
        let event = Event::RequesterCapSet {
            requester: requester.to_string(),
            cap,
        };
        self.persist_requester(&mut req, &event).await?;
        info!("requester {requester} cap set to {cap}");
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. Bookings in every status are kept.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        // Exclusive gate: no mutation is between its WAL append and its apply.
        let _gate = self
            .bounded(self.commit_gate.write(), || "commit gate (compaction)".to_string())
            .await?;

        let mut events = Vec::new();

        let mut resources: Vec<Arc<Resource>> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        resources.sort_by_key(|r| r.id);
        for r in resources {
            events.push(Event::ResourceLoaded {
                resource: (*r).clone(),
            });
        }

        let requesters: Vec<(RequesterId, super::SharedRequester)> = self
            .requesters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (requester, rs) in requesters {
            let guard = rs.lock().await;
            if let Some(cap) = guard.cap {
                events.push(Event::RequesterCapSet { requester, cap });
            }
        }

        let mut ledgers: Vec<(LedgerKey, super::SharedLedger)> = self
            .ledgers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        ledgers.sort_by_key(|(k, _)| *k);
        for (_, ledger) in ledgers {
            let guard = ledger.read().await;
            for booking in &guard.bookings {
                events.push(Event::BookingReserved {
                    booking: booking.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
