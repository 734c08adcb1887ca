//! Approval and rejection.
//!
//! Both are one-way exits from PENDING. Anything already decided stays
//! decided; CANCELLED has no inbound edge here.

use serde_json::json;
use ulid::Ulid;

use crate::access::{require_any_role, APPROVERS};
use crate::audit::AuditAction;
use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::notify::Notice;

use super::conflict::{check_no_conflict, now_ms};
use super::{observe, Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn verb(self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

/// The only legal status edges.
pub fn transition(from: BookingStatus, decision: Decision) -> Option<BookingStatus> {
    match (from, decision) {
        (BookingStatus::Pending, Decision::Approve) => Some(BookingStatus::Approved),
        (BookingStatus::Pending, Decision::Reject) => Some(BookingStatus::Rejected),
        _ => None,
    }
}

fn ensure_transition(booking: &Booking, decision: Decision) -> Result<BookingStatus, EngineError> {
    transition(booking.status, decision).ok_or(EngineError::InvalidTransition {
        id: booking.id,
        status: booking.status,
        action: decision.verb(),
    })
}

impl Engine {
    pub async fn approve_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let result = self.approve_inner(actor, id).await;
        observe("approve", &result);
        result
    }

    pub async fn reject_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let result = self.reject_inner(actor, id, reason).await;
        observe("reject", &result);
        result
    }

    async fn approve_inner(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        require_any_role(actor, APPROVERS, "approve bookings")?;
        let gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(&id).await?;
        ensure_transition(&booking, Decision::Approve)?;

        // An unassigned booking holds nothing, so there is nothing to re-check.
        let mut schedule = match booking.vehicle_id {
            Some(vid) => Some(self.schedule(vid).write_owned().await),
            None => None,
        };
        if let Some(sched) = schedule.as_deref() {
            check_no_conflict(sched, &booking.span, Some(id))?;
        }

        let event = Event::BookingApproved {
            id,
            approved_by: actor.id,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        booking.apply(&event);
        if let Some(sched) = schedule.as_deref_mut() {
            sched.sync(&booking);
        }
        let approved = booking.clone();
        drop(schedule);
        drop(booking);
        drop(gate);

        tracing::info!(%id, by = %actor.id, "booking approved");
        self.publish(Notice::StatusChange {
            booking_id: id,
            vehicle_id: approved.vehicle_id,
            status: approved.status,
        });
        self.record_audit(
            actor,
            AuditAction::BookingApprove,
            json!({ "booking_id": id.to_string(), "ticket": approved.ticket.to_string() }),
        )
        .await;
        Ok(approved)
    }

    async fn reject_inner(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        require_any_role(actor, APPROVERS, "reject bookings")?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reject reason too long"));
        }

        let gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(&id).await?;
        ensure_transition(&booking, Decision::Reject)?;

        // Rejection only ever releases a claim; the schedule lock keeps the
        // mirrored status in step with the booking.
        let mut schedule = match booking.vehicle_id {
            Some(vid) => Some(self.schedule(vid).write_owned().await),
            None => None,
        };

        let event = Event::BookingRejected {
            id,
            rejected_by: actor.id,
            at: now_ms(),
            reason: reason.clone(),
        };
        self.wal_append(&event).await?;
        booking.apply(&event);
        if let Some(sched) = schedule.as_deref_mut() {
            sched.sync(&booking);
        }
        let rejected = booking.clone();
        drop(schedule);
        drop(booking);
        drop(gate);

        tracing::info!(%id, by = %actor.id, "booking rejected");
        self.publish(Notice::StatusChange {
            booking_id: id,
            vehicle_id: rejected.vehicle_id,
            status: rejected.status,
        });
        self.record_audit(
            actor,
            AuditAction::BookingReject,
            json!({ "booking_id": id.to_string(), "reason": reason }),
        )
        .await;
        Ok(rejected)
    }
}
