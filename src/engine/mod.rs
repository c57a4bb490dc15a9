mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;

pub use availability::AvailabilityIndex;
pub use error::{EngineError, ErrorKind};
pub use ledger::{DayLedger, RequesterState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::DEFAULT_REQUESTER_CAP;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<DayLedger>>;
pub type SharedRequester = Arc<Mutex<RequesterState>>;

/// Tunables that do not change for the lifetime of an engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Cap on simultaneous scheduled bookings for requesters without an override.
    pub default_cap: u32,
    /// Upper bound on any single lock wait before failing with `LockTimeout`.
    pub lock_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_cap: DEFAULT_REQUESTER_CAP,
            lock_timeout: Duration::from_secs(2),
        }
    }
}

// ── WAL writer task ──────────────────────────────────────

/// Requests to the task that owns the site's WAL file.
pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends queued while a flush was running are written
/// together and share one fsync; a compaction or counter request queued
/// behind them runs only once they are durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                run_maintenance(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut next = None;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    next = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = next {
            run_maintenance(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = write_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(ref e) = result {
        warn!("WAL write of {} events failed, rolling back: {e}", batch.len());
        wal.rollback();
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

/// All or nothing: on error the caller rolls the file back to its last
/// synced length.
fn write_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    for (event, _) in batch {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

fn run_maintenance(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// The booking engine of one site: slot validation, availability, reservations.
///
/// Lock order, always: commit gate (shared) → day ledger → requester.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, Arc<Resource>>,
    pub(super) ledgers: DashMap<LedgerKey, SharedLedger>,
    pub(super) requesters: DashMap<RequesterId, SharedRequester>,
    /// Reverse lookup: booking id → the day ledger holding it.
    pub(super) booking_to_ledger: DashMap<Ulid, LedgerKey>,
    pub index: AvailabilityIndex,
    pub notify: Arc<NotifyHub>,
    pub(super) settings: EngineSettings,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so its
    /// snapshot cannot miss an in-flight append.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a booking event to its day ledger (no locking; caller holds the lock).
fn apply_to_ledger(ledger: &mut DayLedger, event: &Event, booking_map: &DashMap<Ulid, LedgerKey>) {
    match event {
        Event::BookingReserved { booking } => {
            booking_map.insert(booking.id, ledger.key);
            ledger.insert(booking.clone());
        }
        Event::BookingCancelled { id, at, .. } => {
            if let Some(b) = ledger.get_mut(id) {
                b.status = BookingStatus::Cancelled;
                b.updated_at = *at;
            }
        }
        Event::BookingCompleted { id, at, .. } => {
            if let Some(b) = ledger.get_mut(id) {
                b.status = BookingStatus::Completed;
                b.updated_at = *at;
            }
        }
        Event::ResourceLoaded { .. } | Event::RequesterCapSet { .. } => {}
    }
}

/// Apply an event to the requester's bookkeeping (caller holds the lock).
fn apply_to_requester(rs: &mut RequesterState, event: &Event) {
    match event {
        Event::BookingReserved { booking } if booking.status == BookingStatus::Scheduled => {
            rs.active.insert(booking.id);
        }
        Event::BookingCancelled { id, .. } | Event::BookingCompleted { id, .. } => {
            rs.active.remove(id);
        }
        Event::RequesterCapSet { cap, .. } => rs.cap = Some(*cap),
        _ => {}
    }
}

fn event_requester(event: &Event) -> Option<&str> {
    match event {
        Event::BookingReserved { booking } => Some(&booking.requester),
        Event::BookingCancelled { requester, .. }
        | Event::BookingCompleted { requester, .. }
        | Event::RequesterCapSet { requester, .. } => Some(requester),
        Event::ResourceLoaded { .. } => None,
    }
}

fn event_ledger_key(event: &Event) -> Option<LedgerKey> {
    match event {
        Event::BookingReserved { booking } => Some(booking.slot.key()),
        Event::BookingCancelled { slot, .. } | Event::BookingCompleted { slot, .. } => {
            Some(slot.key())
        }
        Event::ResourceLoaded { .. } | Event::RequesterCapSet { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, settings: EngineSettings) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            ledgers: DashMap::new(),
            requesters: DashMap::new(),
            booking_to_ledger: DashMap::new(),
            index: AvailabilityIndex::new(),
            notify,
            settings,
            wal_tx,
            commit_gate: RwLock::new(()),
        };
        engine.rebuild(&events);
        info!(
            "replayed {} events from {}: {} resources, {} bookings",
            events.len(),
            wal_path.display(),
            engine.resources.len(),
            engine.booking_to_ledger.len()
        );
        Ok(engine)
    }

    /// Rebuild in-memory state from replayed events. State is assembled in
    /// plain maps first and only then wrapped in locks, so no lock is touched.
    fn rebuild(&self, events: &[Event]) {
        use std::collections::HashMap;

        let mut ledgers: HashMap<LedgerKey, DayLedger> = HashMap::new();
        let mut requesters: HashMap<RequesterId, RequesterState> = HashMap::new();

        for event in events {
            if let Event::ResourceLoaded { resource } = event {
                self.resources.insert(resource.id, Arc::new(resource.clone()));
                continue;
            }
            if let Some(key) = event_ledger_key(event) {
                let ledger = ledgers.entry(key).or_insert_with(|| DayLedger::new(key));
                apply_to_ledger(ledger, event, &self.booking_to_ledger);
            }
            if let Some(requester) = event_requester(event) {
                let rs = requesters.entry(requester.to_string()).or_default();
                apply_to_requester(rs, event);
            }
        }

        for (key, ledger) in ledgers {
            self.index.publish(&ledger);
            self.ledgers.insert(key, Arc::new(RwLock::new(ledger)));
        }
        for (requester, rs) in requesters {
            self.requesters.insert(requester, Arc::new(Mutex::new(rs)));
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<Arc<Resource>> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_ledger_for_booking(&self, booking_id: &Ulid) -> Option<LedgerKey> {
        self.booking_to_ledger.get(booking_id).map(|e| *e.value())
    }

    /// Shared hold on the commit gate, bounded by the lock timeout.
    pub(super) async fn enter_commit(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        self.bounded(self.commit_gate.read(), || "commit gate".to_string())
            .await
    }

    /// Write-lock the day ledger for `key`, creating an empty one if needed.
    pub(super) async fn lock_ledger(
        &self,
        key: LedgerKey,
    ) -> Result<OwnedRwLockWriteGuard<DayLedger>, EngineError> {
        let ledger = self
            .ledgers
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(key))))
            .value()
            .clone();
        self.bounded(ledger.write_owned(), || format!("ledger {} {}", key.0, key.1))
            .await
    }

    pub(super) async fn lock_requester(
        &self,
        requester: &str,
    ) -> Result<OwnedMutexGuard<RequesterState>, EngineError> {
        let rs = self
            .requesters
            .entry(requester.to_string())
            .or_default()
            .value()
            .clone();
        self.bounded(rs.lock_owned(), || format!("requester {requester}"))
            .await
    }

    async fn bounded<F, T>(&self, fut: F, what: impl FnOnce() -> String) -> Result<T, EngineError>
    where
        F: std::future::Future<Output = T>,
    {
        match tokio::time::timeout(self.settings.lock_timeout, fut).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let what = what();
                warn!("lock wait exceeded {:?} on {what}", self.settings.lock_timeout);
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                Err(EngineError::LockTimeout(what))
            }
        }
    }

    /// WAL-append + apply + publish + notify for a booking event.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut DayLedger,
        requester: &mut RequesterState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(ledger, event, &self.booking_to_ledger);
        apply_to_requester(requester, event);
        self.index.publish(ledger);
        if let Some(resource_id) = event.resource_id() {
            self.notify.send(resource_id, event);
        }
        Ok(())
    }

    pub(super) async fn persist_requester(
        &self,
        requester: &mut RequesterState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_requester(requester, event);
        Ok(())
    }
}
