use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// `num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Midnight UTC of `date`, in unix ms.
pub fn day_start(date: NaiveDate) -> Ms {
    (date.num_days_from_ce() as i64 - UNIX_EPOCH_DAYS_FROM_CE) * DAY_MS
}

/// UTC calendar date containing the instant `t`.
pub fn date_of(t: Ms) -> Option<NaiveDate> {
    let days = t.div_euclid(DAY_MS) + UNIX_EPOCH_DAYS_FROM_CE;
    NaiveDate::from_num_days_from_ce_opt(i32::try_from(days).ok()?)
}

// ── Booking status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    /// Reserved for cancellation support; nothing transitions here yet.
    Cancelled,
}

impl BookingStatus {
    /// Whether a booking in this status occupies its vehicle. Rejected and
    /// cancelled bookings never block anyone.
    pub fn holds_vehicle(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Approved => "APPROVED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Manager => "MANAGER",
            Role::Admin => "ADMIN",
        }
    }
}

/// Whoever is performing an operation. The wire layer resolves it from the
/// user registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }
}

// ── Legacy date + period ─────────────────────────────────────────

/// Coarse half-day booking periods from the date+period booking model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Period {
    Am,
    Pm,
    Full,
}

impl Period {
    /// Fixed daily window as `(start_hour, end_hour)`.
    pub fn hours(self) -> (i64, i64) {
        match self {
            Period::Am => (8, 12),
            Period::Pm => (13, 18),
            Period::Full => (8, 18),
        }
    }

    /// The canonical interval this period covers on `date` (UTC).
    pub fn span_on(self, date: NaiveDate) -> Span {
        let midnight = day_start(date);
        let (from, to) = self.hours();
        Span::new(midnight + from * HOUR_MS, midnight + to * HOUR_MS)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Am => "AM",
            Period::Pm => "PM",
            Period::Full => "FULL",
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AM" => Ok(Period::Am),
            "PM" => Ok(Period::Pm),
            "FULL" => Ok(Period::Full),
            other => Err(format!("unknown period: {other}")),
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub ticket: Ulid,
    pub requester_id: Ulid,
    pub requested_for_id: Ulid,
    pub span: Span,
    pub vehicle_id: Option<Ulid>,
    pub driver_id: Option<Ulid>,
    pub status: BookingStatus,
    /// Manager who approved or rejected.
    pub decided_by: Option<Ulid>,
    pub decided_at: Option<Ms>,
    pub reject_reason: Option<String>,
    pub created_at: Ms,
}

/// A vehicle's claim on a time range, mirrored from the owning booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub booking_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
}

/// Every booking currently attached to one vehicle, sorted by `span.start`.
/// Rejected bookings stay listed so the schedule mirrors the booking table;
/// the conflict detector skips them.
#[derive(Debug, Clone)]
pub struct VehicleSchedule {
    pub vehicle_id: Ulid,
    pub intervals: Vec<Interval>,
}

impl VehicleSchedule {
    pub fn new(vehicle_id: Ulid) -> Self {
        Self {
            vehicle_id,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, booking_id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.booking_id == booking_id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    /// Make this schedule's entry for `booking` match the booking record:
    /// present (with current status) iff the booking is on this vehicle.
    pub fn sync(&mut self, booking: &Booking) {
        self.remove_interval(booking.id);
        if booking.vehicle_id == Some(self.vehicle_id) {
            self.insert_interval(Interval {
                booking_id: booking.id,
                span: booking.span,
                status: booking.status,
            });
        }
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        id: Ulid,
        ticket: Ulid,
        requester_id: Ulid,
        requested_for_id: Ulid,
        span: Span,
        vehicle_id: Option<Ulid>,
        created_at: Ms,
    },
    BookingApproved {
        id: Ulid,
        approved_by: Ulid,
        at: Ms,
    },
    BookingRejected {
        id: Ulid,
        rejected_by: Ulid,
        at: Ms,
        reason: Option<String>,
    },
    VehicleAssigned {
        id: Ulid,
        vehicle_id: Ulid,
    },
    DriverAssigned {
        id: Ulid,
        driver_id: Ulid,
    },
}

impl Event {
    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::BookingCreated { id, .. }
            | Event::BookingApproved { id, .. }
            | Event::BookingRejected { id, .. }
            | Event::VehicleAssigned { id, .. }
            | Event::DriverAssigned { id, .. } => *id,
        }
    }
}

impl Booking {
    /// Build the initial record from a `BookingCreated` event.
    pub fn from_created(event: &Event) -> Option<Self> {
        match event {
            Event::BookingCreated {
                id,
                ticket,
                requester_id,
                requested_for_id,
                span,
                vehicle_id,
                created_at,
            } => Some(Self {
                id: *id,
                ticket: *ticket,
                requester_id: *requester_id,
                requested_for_id: *requested_for_id,
                span: *span,
                vehicle_id: *vehicle_id,
                driver_id: None,
                status: BookingStatus::Pending,
                decided_by: None,
                decided_at: None,
                reject_reason: None,
                created_at: *created_at,
            }),
            _ => None,
        }
    }

    /// Apply a follow-up event to this record. `BookingCreated` is a no-op here.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingApproved { approved_by, at, .. } => {
                self.status = BookingStatus::Approved;
                self.decided_by = Some(*approved_by);
                self.decided_at = Some(*at);
                self.reject_reason = None;
            }
            Event::BookingRejected {
                rejected_by,
                at,
                reason,
                ..
            } => {
                self.status = BookingStatus::Rejected;
                self.decided_by = Some(*rejected_by);
                self.decided_at = Some(*at);
                self.reject_reason = reason.clone();
            }
            Event::VehicleAssigned { vehicle_id, .. } => self.vehicle_id = Some(*vehicle_id),
            Event::DriverAssigned { driver_id, .. } => self.driver_id = Some(*driver_id),
            Event::BookingCreated { .. } => {}
        }
    }
}
