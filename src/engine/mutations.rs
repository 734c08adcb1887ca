use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::access::{require_any_role, APPROVERS};
use crate::audit::AuditAction;
use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::conflict::{check_no_conflict, now_ms, validate_interval};
use super::{observe, Engine, EngineError, WalCommand};

/// A booking request in canonical interval form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Only managers and admins may pick the vehicle up front.
    pub vehicle_id: Option<Ulid>,
    /// Defaults to the actor. Naming someone else needs a manager or admin.
    pub requested_for: Option<Ulid>,
}

impl Engine {
    pub async fn create_booking(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        let result = self.create_booking_inner(actor, req).await;
        observe("create", &result);
        result
    }

    /// Legacy date + period request, mapped onto its fixed daily window.
    pub async fn create_period_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        date: NaiveDate,
        period: Period,
        vehicle_id: Option<Ulid>,
        requested_for: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let span = period.span_on(date);
        self.create_booking(
            actor,
            NewBooking {
                id,
                start: span.start,
                end: span.end,
                vehicle_id,
                requested_for,
            },
        )
        .await
    }

    async fn create_booking_inner(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        let gate = self.commit_gate.read().await;
        let span = validate_interval(req.start, req.end)?;

        let requested_for_id = match req.requested_for {
            Some(other) if other != actor.id => {
                require_any_role(actor, APPROVERS, "book on behalf of another member")?;
                other
            }
            _ => actor.id,
        };
        if let Some(vid) = req.vehicle_id {
            require_any_role(actor, APPROVERS, "pre-select a vehicle")?;
            self.require_active_vehicle(vid)?;
        }
        if self.bookings.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let schedule = req.vehicle_id.map(|vid| self.schedule(vid));
        let mut schedule_guard = match schedule {
            Some(s) => Some(s.write_owned().await),
            None => None,
        };
        if let Some(sched) = schedule_guard.as_deref() {
            if sched.intervals.len() >= MAX_BOOKINGS_PER_VEHICLE {
                return Err(EngineError::LimitExceeded("too many bookings on vehicle"));
            }
            check_no_conflict(sched, &span, None)?;
        }

        let event = Event::BookingCreated {
            id: req.id,
            ticket: self.fresh_ticket(),
            requester_id: actor.id,
            requested_for_id,
            span,
            vehicle_id: req.vehicle_id,
            created_at: now_ms(),
        };
        let booking = Booking::from_created(&event)
            .ok_or_else(|| EngineError::Validation("not a creation event".into()))?;

        // Claim the id while holding the new booking's lock, so readers wait
        // for the WAL write instead of seeing an uncommitted record.
        let shared = Arc::new(RwLock::new(booking.clone()));
        let booking_guard = shared
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::AlreadyExists(req.id))?;
        match self.bookings.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(shared.clone());
            }
        }

        if let Err(e) = self.wal_append(&event).await {
            self.bookings.remove_if(&req.id, |_, v| Arc::ptr_eq(v, &shared));
            return Err(e);
        }
        self.tickets.insert(booking.ticket, booking.id);
        if let Some(sched) = schedule_guard.as_deref_mut() {
            sched.sync(&booking);
        }
        drop(schedule_guard);
        drop(booking_guard);
        drop(gate);

        metrics::gauge!(crate::observability::BOOKINGS_LOADED).set(self.bookings.len() as f64);
        tracing::info!(id = %booking.id, ticket = %booking.ticket, vehicle = ?booking.vehicle_id, "booking created");
        self.publish(Notice::BookingNew {
            booking_id: booking.id,
            start: booking.span.start,
            end: booking.span.end,
            vehicle_id: booking.vehicle_id,
        });
        self.record_audit(
            actor,
            AuditAction::BookingCreate,
            json!({
                "booking_id": booking.id.to_string(),
                "ticket": booking.ticket.to_string(),
                "requested_for": booking.requested_for_id.to_string(),
                "vehicle_id": booking.vehicle_id.map(|v| v.to_string()),
                "start": booking.span.start,
                "end": booking.span.end,
            }),
        )
        .await;
        Ok(booking)
    }

    /// Tickets are never reused, even across bookings that no longer matter.
    fn fresh_ticket(&self) -> Ulid {
        loop {
            let ticket = Ulid::new();
            if !self.tickets.contains_key(&ticket) {
                return ticket;
            }
        }
    }

    /// Unknown vehicles are NotFound; known but inactive ones are invalid input.
    pub(super) fn require_active_vehicle(&self, vehicle_id: Ulid) -> Result<(), EngineError> {
        let vehicle = self
            .registry
            .vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        if !vehicle.active {
            return Err(EngineError::Validation(format!("vehicle {vehicle_id} is inactive")));
        }
        Ok(())
    }

    pub(super) fn require_active_driver(&self, driver_id: Ulid) -> Result<(), EngineError> {
        let driver = self
            .registry
            .driver(&driver_id)
            .ok_or(EngineError::NotFound(driver_id))?;
        if !driver.active {
            return Err(EngineError::Validation(format!("driver {driver_id} is inactive")));
        }
        Ok(())
    }

    /// Rewrite the WAL as one creation plus follow-ups per booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let shared: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut snapshot = Vec::with_capacity(shared.len());
        for booking in shared {
            snapshot.push(booking.read().await.clone());
        }
        snapshot.sort_by_key(|b| (b.created_at, b.id));

        let mut events = Vec::with_capacity(snapshot.len());
        for b in &snapshot {
            events.extend(snapshot_events(b));
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
        tracing::info!(bookings = snapshot.len(), events = count, "WAL compacted");
        Ok(())
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

/// Events that rebuild `b` exactly. The creation carries the current vehicle.
fn snapshot_events(b: &Booking) -> Vec<Event> {
    let mut events = vec![Event::BookingCreated {
        id: b.id,
        ticket: b.ticket,
        requester_id: b.requester_id,
        requested_for_id: b.requested_for_id,
        span: b.span,
        vehicle_id: b.vehicle_id,
        created_at: b.created_at,
    }];
    if let Some(driver_id) = b.driver_id {
        events.push(Event::DriverAssigned { id: b.id, driver_id });
    }
    match (b.status, b.decided_by, b.decided_at) {
        (BookingStatus::Approved, Some(approved_by), Some(at)) => {
            events.push(Event::BookingApproved { id: b.id, approved_by, at });
        }
        (BookingStatus::Rejected, Some(rejected_by), Some(at)) => {
            events.push(Event::BookingRejected {
                id: b.id,
                rejected_by,
                at,
                reason: b.reject_reason.clone(),
            });
        }
        _ => {}
    }
    events
}
