//! Time-range conflict detection for same-day bookings.
//!
//! All times are zero-padded `HH:MM` strings, so lexicographic comparison
//! is chronological comparison. Intervals are half-open: a booking ending
//! at 11:00 does not conflict with one starting at 11:00.

use chrono::NaiveDateTime;

use crate::models::booking_status;

/// Grace period during which a provisional (`temp`/`on_hold`) booking
/// still blocks its slot before being treated as released.
pub const HOLD_WINDOW_MINUTES: i64 = 10;

/// Timestamp format used throughout the bookings table.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Minimal view of a booking row needed for conflict checks.
#[derive(Debug, Clone)]
pub struct BookingWindow<'a> {
    pub start_time: &'a str,
    pub end_time: &'a str,
    pub status: &'a str,
    pub created_at: &'a str,
    pub deleted: bool,
}

impl<'a> From<&'a crate::models::Booking> for BookingWindow<'a> {
    fn from(b: &'a crate::models::Booking) -> Self {
        Self {
            start_time: &b.start_time,
            end_time: &b.end_time,
            status: &b.status,
            created_at: &b.created_at,
            deleted: b.deleted_at.is_some(),
        }
    }
}

/// Half-open interval overlap. Touching endpoints do not count.
pub fn ranges_overlap(a_start: &str, a_end: &str, b_start: &str, b_end: &str) -> bool {
    a_start < b_end && b_start < a_end
}

/// Whether a booking is in a provisional reservation state.
pub fn is_provisional(status: &str) -> bool {
    status == booking_status::TEMP || status == booking_status::ON_HOLD
}

/// Whether a provisional hold created at `created_at` has outlived the
/// hold window as of `now`. Unparseable timestamps keep blocking.
pub fn hold_expired(created_at: &str, now: NaiveDateTime) -> bool {
    match NaiveDateTime::parse_from_str(created_at, TIMESTAMP_FORMAT) {
        Ok(created) => (now - created).num_minutes() >= HOLD_WINDOW_MINUTES,
        Err(_) => false,
    }
}

/// Check a candidate `[start, end)` range against existing same-date
/// bookings.
///
/// Cancelled and soft-deleted bookings never conflict. Provisional holds
/// are skipped entirely when `exclude_temporary` is set; otherwise only
/// holds older than [`HOLD_WINDOW_MINUTES`] are skipped, so a fresh hold
/// from another customer still blocks the slot.
pub fn any_booking_overlaps(
    candidate_start: &str,
    candidate_end: &str,
    existing: &[BookingWindow<'_>],
    exclude_temporary: bool,
    now: NaiveDateTime,
) -> bool {
    existing.iter().any(|b| {
        if b.deleted || b.status == booking_status::CANCELLED {
            return false;
        }
        if is_provisional(b.status) {
            if exclude_temporary {
                return false;
            }
            if hold_expired(b.created_at, now) {
                return false;
            }
        }
        ranges_overlap(candidate_start, candidate_end, b.start_time, b.end_time)
    })
}

// ── Tests ──
