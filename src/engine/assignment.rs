use serde_json::json;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::access::{require_any_role, APPROVERS};
use crate::audit::AuditAction;
use crate::limits::MAX_BOOKINGS_PER_VEHICLE;
use crate::model::*;
use crate::notify::Notice;

use super::conflict::check_no_conflict;
use super::{observe, Engine, EngineError};

/// Assignment is only meaningful while the booking still holds a claim.
fn ensure_assignable(booking: &Booking, action: &'static str) -> Result<(), EngineError> {
    if booking.status.holds_vehicle() {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            id: booking.id,
            status: booking.status,
            action,
        })
    }
}

impl Engine {
    pub async fn assign_vehicle(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        vehicle_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let result = self.assign_vehicle_inner(actor, booking_id, vehicle_id).await;
        observe("assign_vehicle", &result);
        result
    }

    pub async fn assign_driver(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        driver_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let result = self.assign_driver_inner(actor, booking_id, driver_id).await;
        observe("assign_driver", &result);
        result
    }

    /// Lock the outgoing and incoming schedules in ascending vehicle id.
    /// Returns `(previous, target)`.
    async fn lock_schedule_pair(
        &self,
        previous: Option<Ulid>,
        target: Ulid,
    ) -> (
        Option<OwnedRwLockWriteGuard<VehicleSchedule>>,
        OwnedRwLockWriteGuard<VehicleSchedule>,
    ) {
        match previous {
            Some(prev) if prev < target => {
                let p = self.schedule(prev).write_owned().await;
                let t = self.schedule(target).write_owned().await;
                (Some(p), t)
            }
            Some(prev) => {
                let t = self.schedule(target).write_owned().await;
                let p = self.schedule(prev).write_owned().await;
                (Some(p), t)
            }
            None => (None, self.schedule(target).write_owned().await),
        }
    }

    async fn assign_vehicle_inner(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        vehicle_id: Ulid,
    ) -> Result<Booking, EngineError> {
        require_any_role(actor, APPROVERS, "assign vehicles")?;
        let gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(&booking_id).await?;
        if booking.vehicle_id == Some(vehicle_id) {
            return Ok(booking.clone());
        }
        ensure_assignable(&booking, "assign a vehicle to")?;
        self.require_active_vehicle(vehicle_id)?;

        let previous = booking.vehicle_id;
        let (mut old_schedule, mut new_schedule) = self.lock_schedule_pair(previous, vehicle_id).await;
        if new_schedule.intervals.len() >= MAX_BOOKINGS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many bookings on vehicle"));
        }
        check_no_conflict(&new_schedule, &booking.span, Some(booking_id))?;

        let event = Event::VehicleAssigned {
            id: booking_id,
            vehicle_id,
        };
        self.wal_append(&event).await?;
        booking.apply(&event);
        new_schedule.sync(&booking);
        if let Some(old) = old_schedule.as_deref_mut() {
            old.sync(&booking);
        }
        let updated = booking.clone();
        drop(old_schedule);
        drop(new_schedule);
        drop(booking);
        drop(gate);

        tracing::info!(id = %booking_id, from = ?previous, to = %vehicle_id, "vehicle assigned");
        self.publish(Notice::VehicleAssigned {
            booking_id,
            from: previous,
            vehicle_id,
        });
        self.record_audit(
            actor,
            AuditAction::BookingAssignVehicle,
            json!({
                "booking_id": booking_id.to_string(),
                "from": previous.map(|v| v.to_string()),
                "to": vehicle_id.to_string(),
            }),
        )
        .await;
        Ok(updated)
    }

    async fn assign_driver_inner(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        driver_id: Ulid,
    ) -> Result<Booking, EngineError> {
        require_any_role(actor, APPROVERS, "assign drivers")?;
        let gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(&booking_id).await?;
        if booking.driver_id == Some(driver_id) {
            return Ok(booking.clone());
        }
        ensure_assignable(&booking, "assign a driver to")?;
        self.require_active_driver(driver_id)?;

        let previous = booking.driver_id;
        let event = Event::DriverAssigned {
            id: booking_id,
            driver_id,
        };
        self.wal_append(&event).await?;
        booking.apply(&event);
        let updated = booking.clone();
        drop(booking);
        drop(gate);

        tracing::info!(id = %booking_id, from = ?previous, to = %driver_id, "driver assigned");
        self.publish(Notice::DriverAssigned {
            booking_id,
            driver_id,
        });
        self.record_audit(
            actor,
            AuditAction::BookingAssignDriver,
            json!({
                "booking_id": booking_id.to_string(),
                "from": previous.map(|d| d.to_string()),
                "to": driver_id.to_string(),
            }),
        )
        .await;
        Ok(updated)
    }
}
