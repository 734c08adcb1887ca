use crate::model::{DAY_MS, Ms};

/// 1970-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// A single booking may not hold a vehicle for more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;

pub const MAX_BOOKINGS_PER_VEHICLE: usize = 100_000;
pub const MAX_REASON_LEN: usize = 2_000;
pub const MAX_LOGIN_LEN: usize = 128;
