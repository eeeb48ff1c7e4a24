use serde::{Deserialize, Serialize};

// ── Status domains ──

/// Booking lifecycle states.
pub mod booking_status {
    pub const TEMP: &str = "temp";
    pub const ON_HOLD: &str = "on_hold";
    pub const BOOKED: &str = "booked";
    pub const CONFIRMED: &str = "confirmed";
    pub const CANCELLED: &str = "cancelled";
}

/// Payment sub-states of a booking.
pub mod payment_status {
    pub const UNPAID: &str = "unpaid";
    pub const PENDING: &str = "pending";
    pub const PAID: &str = "paid";
    pub const FAILED: &str = "failed";
    pub const REFUNDED: &str = "refunded";
}

pub mod payment_method {
    pub const CREDITS: &str = "credits";
    pub const SWISH: &str = "swish";
    pub const QLIRO: &str = "qliro";
    pub const PAY_AT_LOCATION: &str = "pay_at_location";
    /// Placeholder reservation while the client finishes the booking flow.
    pub const TEMP: &str = "temp";
}

/// Lesson-type categories. Handledar sessions are capacity-based group
/// courses; everything else is a one-to-one lesson with its own time slot.
pub mod lesson_kind {
    pub const LESSON: &str = "lesson";
    pub const HANDLEDAR: &str = "handledar";
}

pub mod order_status {
    pub const PENDING: &str = "pending";
    pub const PAID: &str = "paid";
    pub const FAILED: &str = "failed";
    pub const EXPIRED: &str = "expired";
}

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TeacherAvailability {
    pub id: i64,
    pub teacher_id: i64,
    /// Day of week, 0 = Sunday .. 6 = Saturday.
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LessonType {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub price: i64,
    pub duration_min: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HandledarSession {
    pub id: i64,
    pub lesson_type_id: i64,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub capacity: i64,
    pub participant_count: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlockedDate {
    pub id: i64,
    pub date: String,
    pub all_day: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub user_id: Option<i64>,
    pub lesson_type_id: i64,
    pub session_id: Option<i64>,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_min: i64,
    pub transmission: Option<String>,
    pub teacher_id: Option<i64>,
    pub vehicle_id: Option<i64>,
    pub status: String,
    pub payment_status: String,
    pub payment_method: Option<String>,
    pub total_price: i64,
    pub guest_name: Option<String>,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
    /// Human-visible payment reference the customer quotes when paying
    /// externally (e.g. as the Swish message).
    pub swish_reference: Option<String>,
    pub completed: bool,
    pub feedback_ready: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Local shadow of a remote Qliro checkout order. At most one of the three
/// correlation columns is set.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QliroOrder {
    pub id: i64,
    pub booking_id: Option<i64>,
    pub handledar_booking_id: Option<i64>,
    pub package_purchase_id: Option<i64>,
    pub remote_order_id: Option<String>,
    pub merchant_reference: String,
    pub amount: i64,
    pub payment_url: Option<String>,
    pub status: String,
    pub environment: String,
    pub callback_token: String,
    pub callback_expires_at: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserCredit {
    pub id: i64,
    pub user_id: i64,
    pub lesson_type_id: Option<i64>,
    pub session_id: Option<i64>,
    pub credits_remaining: i64,
    pub credits_total: i64,
    pub credit_type: String,
    pub package_id: Option<i64>,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub lesson_type_id: i64,
    /// Required for handledar group sessions, ignored for lessons.
    pub session_id: Option<i64>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration_min: Option<i64>,
    pub transmission: Option<String>,
    pub total_price: i64,
    pub payment_method: String,
    /// Privileged only: book on behalf of this student.
    pub student_id: Option<i64>,
    #[serde(default)]
    pub already_paid: bool,
    pub guest_name: Option<String>,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateBookingResponse {
    pub booking: Booking,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BookingStatusResponse {
    pub status: String,
    pub payment_status: String,
}

#[derive(Debug, Deserialize)]
pub struct BookingsQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentActionQuery {
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBlockedDateRequest {
    pub date: String,
    #[serde(default = "default_all_day")]
    pub all_day: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub reason: Option<String>,
}

fn default_all_day() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateAvailabilityRequest {
    pub teacher_id: i64,
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

// ── Response envelopes ──

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Structured rejection payload. The optional flags give the client a
/// machine-checkable reason so it can offer a remediation path (pick
/// another time, link an existing account, select a session instance).
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_session_selection: Option<bool>,
}

impl ApiError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            conflict: None,
            user_exists: None,
            existing_email: None,
            require_session_selection: None,
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            conflict: Some(true),
            ..Self::new(msg)
        }
    }

    pub fn user_exists(email: impl Into<String>) -> Self {
        Self {
            user_exists: Some(true),
            existing_email: Some(email.into()),
            ..Self::new("An account with this email already exists")
        }
    }

    pub fn session_selection(msg: impl Into<String>) -> Self {
        Self {
            require_session_selection: Some(true),
            ..Self::new(msg)
        }
    }
}
