use std::collections::BTreeSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::access::{is_approver, require_any_role, APPROVERS};
use crate::model::*;

use super::conflict::{find_conflict, validate_interval};
use super::{Engine, EngineError};

/// Every UTC date touched by `span`.
fn dates_covered(span: &Span) -> impl Iterator<Item = NaiveDate> {
    let first = date_of(span.start);
    let last = date_of(span.end - 1);
    first
        .zip(last)
        .into_iter()
        .flat_map(|(first, last)| first.iter_days().take_while(move |d| *d <= last))
}

fn visible(actor: &Actor, booking: Booking) -> Option<Booking> {
    let own = booking.requester_id == actor.id || booking.requested_for_id == actor.id;
    (own || is_approver(actor)).then_some(booking)
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        Ok(self.read_booking(&id).await?.clone())
    }

    pub async fn find_by_ticket(&self, ticket: Ulid) -> Result<Booking, EngineError> {
        let id = self
            .tickets
            .get(&ticket)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(ticket))?;
        self.get_booking(id).await
    }

    /// Bookings requested for `user_id`, earliest first.
    pub async fn bookings_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        let mut out = self
            .collect_bookings(|b| b.requested_for_id == user_id)
            .await;
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    /// Every booking currently on `vehicle_id`, in schedule order, any status.
    pub async fn vehicle_bookings(&self, vehicle_id: Ulid) -> Vec<Booking> {
        let Some(schedule) = self.existing_schedule(&vehicle_id) else {
            return Vec::new();
        };
        let ids: Vec<Ulid> = schedule
            .read()
            .await
            .intervals
            .iter()
            .map(|i| i.booking_id)
            .collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            // A booking can move off this vehicle between the two reads.
            if let Ok(b) = self.read_booking(&id).await
                && b.vehicle_id == Some(vehicle_id)
            {
                out.push(b.clone());
            }
        }
        out
    }

    /// Calendar dates with at least one live booking, optionally for one
    /// vehicle. Unassigned bookings count when no vehicle is given.
    pub async fn blocked_dates(&self, vehicle_id: Option<Ulid>) -> Vec<NaiveDate> {
        let spans: Vec<Span> = match vehicle_id {
            Some(vid) => match self.existing_schedule(&vid) {
                Some(schedule) => {
                    let guard = schedule.read().await;
                    guard
                        .intervals
                        .iter()
                        .filter(|i| i.status.holds_vehicle())
                        .map(|i| i.span)
                        .collect()
                }
                None => Vec::new(),
            },
            None => self
                .collect_bookings(|b| b.status.holds_vehicle())
                .await
                .into_iter()
                .map(|b| b.span)
                .collect(),
        };
        let dates: BTreeSet<NaiveDate> = spans.iter().flat_map(|s| dates_covered(s)).collect();
        dates.into_iter().collect()
    }

    /// Read-only overlap query for `[start, end)` on one vehicle. Advisory:
    /// commits re-run the check under the schedule lock.
    pub async fn has_conflict(
        &self,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = validate_interval(start, end)?;
        let Some(schedule) = self.existing_schedule(&vehicle_id) else {
            return Ok(false);
        };
        let guard = schedule.read().await;
        Ok(find_conflict(&guard, &span, exclude).is_some())
    }

    // ── Reads on behalf of a connected actor ─────────────────────
    //
    // Members see only bookings they placed or that were placed for them.
    // A single booking outside that set reads as missing.

    pub async fn get_booking_as(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.get_booking(id).await?;
        visible(actor, booking).ok_or(EngineError::NotFound(id))
    }

    pub async fn find_by_ticket_as(&self, actor: &Actor, ticket: Ulid) -> Result<Booking, EngineError> {
        let booking = self.find_by_ticket(ticket).await?;
        visible(actor, booking).ok_or(EngineError::NotFound(ticket))
    }

    pub async fn bookings_for_user_as(&self, actor: &Actor, user_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if user_id != actor.id {
            require_any_role(actor, APPROVERS, "read another user's bookings")?;
        }
        Ok(self.bookings_for_user(user_id).await)
    }

    pub async fn vehicle_bookings_as(&self, actor: &Actor, vehicle_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        require_any_role(actor, APPROVERS, "list vehicle bookings")?;
        Ok(self.vehicle_bookings(vehicle_id).await)
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let shared: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for booking in shared {
            let b = booking.read().await;
            if keep(&b) {
                out.push(b.clone());
            }
        }
        out
    }
}
