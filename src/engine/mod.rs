mod assignment;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;

pub use error::{EngineError, ErrorKind};
pub use mutations::NewBooking;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEntry, AuditSink};
use crate::model::*;
use crate::notify::{Notice, Notifier};
use crate::registry::ResourceRegistry;
use crate::wal::Wal;

pub type SharedBooking = Arc<RwLock<Booking>>;
pub type SharedSchedule = Arc<RwLock<VehicleSchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is pending share one
/// fsync; any other command first flushes the batch ahead of it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All or nothing: on any append or flush error the log is cut back to
/// where the batch started, since every caller in it is told it failed.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mark = wal.mark()?;
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        if let Err(rollback) = wal.rollback(mark) {
            tracing::error!(error = %rollback, "WAL rollback failed after {e}");
        } else {
            warn!(error = %e, events = batch.len(), "WAL batch rolled back");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => flush_and_respond(wal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The reservation engine.
///
/// Bookings and per-vehicle schedules are each behind their own lock. A
/// commit that can put a booking on a vehicle holds that vehicle's schedule
/// write lock from the conflict check until the event is durable and applied.
/// Locks are taken booking first, then schedules in ascending vehicle id.
pub struct Engine {
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    /// ticket → booking id
    pub(super) tickets: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared for their whole run; compaction takes it
    /// exclusively so its snapshot matches the log it replaces.
    pub(super) commit_gate: RwLock<()>,
    pub registry: Arc<dyn ResourceRegistry>,
    pub audit: Arc<dyn AuditSink>,
    pub notify: Arc<dyn Notifier>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        registry: Arc<dyn ResourceRegistry>,
        audit: Arc<dyn AuditSink>,
        notify: Arc<dyn Notifier>,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            bookings: DashMap::new(),
            schedules: DashMap::new(),
            tickets: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            registry,
            audit,
            notify,
        };
        for event in &events {
            engine.replay_event(event)?;
        }
        metrics::gauge!(crate::observability::BOOKINGS_LOADED).set(engine.bookings.len() as f64);
        tracing::info!(
            events = events.len(),
            bookings = engine.bookings.len(),
            vehicles = engine.schedules.len(),
            "replayed booking log"
        );
        Ok(engine)
    }

    /// Nothing else can see these locks during startup, so `try_write` always
    /// succeeds. Blocking lock calls would panic inside the runtime.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: booking state unexpectedly locked");

        if let Some(booking) = Booking::from_created(event) {
            if self.bookings.contains_key(&booking.id) {
                warn!(id = %booking.id, "replay: duplicate BookingCreated ignored");
                return Ok(());
            }
            if let Some(vid) = booking.vehicle_id {
                self.schedule(vid).try_write().map_err(|_| contended())?.sync(&booking);
            }
            self.tickets.insert(booking.ticket, booking.id);
            self.bookings.insert(booking.id, Arc::new(RwLock::new(booking)));
            return Ok(());
        }

        let id = event.booking_id();
        let Some(shared) = self.bookings.get(&id).map(|e| e.value().clone()) else {
            warn!(%id, "replay: event for unknown booking ignored");
            return Ok(());
        };
        let mut booking = shared.try_write().map_err(|_| contended())?;
        let previous_vehicle = booking.vehicle_id;
        booking.apply(event);
        for vid in [previous_vehicle, booking.vehicle_id].into_iter().flatten() {
            self.schedule(vid).try_write().map_err(|_| contended())?.sync(&booking);
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// Schedule for a vehicle, created empty on first use.
    pub(super) fn schedule(&self, vehicle_id: Ulid) -> SharedSchedule {
        self.schedules
            .entry(vehicle_id)
            .or_insert_with(|| Arc::new(RwLock::new(VehicleSchedule::new(vehicle_id))))
            .value()
            .clone()
    }

    pub(super) fn existing_schedule(&self, vehicle_id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(vehicle_id).map(|e| e.value().clone())
    }

    fn shared_booking(&self, id: &Ulid) -> Result<SharedBooking, EngineError> {
        self.bookings
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    /// A creation whose WAL write failed is withdrawn from the map while its
    /// lock is still held. Anyone who queued on that lock must not see it.
    fn still_live(&self, id: &Ulid, shared: &SharedBooking) -> bool {
        self.bookings
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), shared))
    }

    pub(super) async fn lock_booking(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Booking>, EngineError> {
        let shared = self.shared_booking(id)?;
        let guard = shared.clone().write_owned().await;
        if !self.still_live(id, &shared) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    pub(super) async fn read_booking(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<Booking>, EngineError> {
        let shared = self.shared_booking(id)?;
        let guard = shared.clone().read_owned().await;
        if !self.still_live(id, &shared) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    pub(super) fn publish(&self, notice: Notice) {
        tracing::debug!(kind = notice.kind(), "publish");
        self.notify.publish(notice);
    }

    /// Record an audit entry. Failures are logged and counted, never returned.
    pub(super) async fn record_audit(&self, actor: &Actor, action: AuditAction, metadata: serde_json::Value) {
        let entry = AuditEntry {
            actor_id: actor.id,
            action,
            metadata,
            at: conflict::now_ms(),
        };
        if let Err(e) = self.audit.record(entry).await {
            metrics::counter!(crate::observability::AUDIT_FAILURES_TOTAL).increment(1);
            warn!(actor = %actor.id, ?action, "audit record failed: {e}");
        }
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}

/// Count a finished booking operation by name and outcome.
pub(super) fn observe<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(crate::observability::BOOKING_OPS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
}
