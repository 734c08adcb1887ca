use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Reject `end <= start` and anything outside the supported time range.
pub(crate) fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::Validation(format!(
            "end ({end}) must be after start ({start})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// First booking on this schedule that still holds the vehicle and overlaps
/// `span`. Boundary touches don't count.
pub(crate) fn find_conflict(
    schedule: &VehicleSchedule,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    schedule
        .overlapping(span)
        .filter(|i| i.status.holds_vehicle())
        .find(|i| Some(i.booking_id) != exclude)
        .map(|i| i.booking_id)
}

/// Commit-point check. Callers hold the schedule's write lock.
pub(crate) fn check_no_conflict(
    schedule: &VehicleSchedule,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(schedule, span, exclude) {
        Some(other) => {
            metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL).increment(1);
            tracing::debug!(vehicle = %schedule.vehicle_id, %other, "interval conflict");
            Err(EngineError::Conflict(other))
        }
        None => Ok(()),
    }
}
