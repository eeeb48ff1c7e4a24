//! Booking lifecycle: creation with per-method payment branches, the
//! Swish confirmation step, client booking queries, cancellation, and
//! the stale-hold sweep.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDateTime;
use rand::RngCore;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::auth::{self, Actor};
use crate::models::{
    booking_status, lesson_kind, payment_method, payment_status, ApiError, ApiResponse, BlockedDate,
    Booking, BookingStatusResponse, CreateBookingRequest, CreateBookingResponse, HandledarSession,
    LessonType, SessionsQuery, UserCredit,
};
use crate::notify::NotificationTrigger;
use crate::overlap::{self, BookingWindow, HOLD_WINDOW_MINUTES, TIMESTAMP_FORMAT};
use crate::qliro::OrderCorrelation;
use crate::{allocator, credits, AppState};

fn now_utc() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

fn now_string() -> String {
    now_utc().format(TIMESTAMP_FORMAT).to_string()
}

/// Short customer-facing payment reference, quoted as the Swish message.
fn payment_reference() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes).to_uppercase()
}

// ── Errors ──

/// Rejections from the booking lifecycle, mapped onto the structured
/// error payload.
#[derive(Debug)]
pub enum BookingError {
    Validation(String),
    DateBlocked(String),
    Conflict,
    CapacityExceeded,
    EmailExists(String),
    SessionSelectionRequired,
    NotFound,
    Unauthorized,
    Internal(anyhow::Error),
}

impl From<sqlx::Error> for BookingError {
    fn from(e: sqlx::Error) -> Self {
        BookingError::Internal(e.into())
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            BookingError::Validation(msg) => (StatusCode::BAD_REQUEST, ApiError::new(msg)),
            BookingError::DateBlocked(msg) => (StatusCode::BAD_REQUEST, ApiError::new(msg)),
            BookingError::Conflict => (
                StatusCode::BAD_REQUEST,
                ApiError::conflict("The selected time is no longer available"),
            ),
            BookingError::CapacityExceeded => (
                StatusCode::BAD_REQUEST,
                ApiError::new("This session is fully booked"),
            ),
            BookingError::EmailExists(email) => {
                (StatusCode::BAD_REQUEST, ApiError::user_exists(email))
            }
            BookingError::SessionSelectionRequired => (
                StatusCode::BAD_REQUEST,
                ApiError::session_selection("Select a session for this course"),
            ),
            BookingError::NotFound => (StatusCode::NOT_FOUND, ApiError::new("Booking not found")),
            BookingError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ApiError::new("Authentication required"),
            ),
            BookingError::Internal(e) => {
                tracing::error!("booking operation failed: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::new("Internal server error"),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

// ── Catalogue ──

pub async fn list_lesson_types(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<LessonType>>>, BookingError> {
    let types: Vec<LessonType> =
        sqlx::query_as("SELECT * FROM lesson_types WHERE is_active = 1 ORDER BY id")
            .fetch_all(&state.db)
            .await?;
    Ok(Json(ApiResponse::success(types)))
}

pub async fn list_handledar_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<ApiResponse<Vec<HandledarSession>>>, BookingError> {
    let today = now_utc().date().format("%Y-%m-%d").to_string();
    let from = query.date.clone().or(query.from).unwrap_or(today);
    let to = query.to.unwrap_or_else(|| "9999-12-31".into());

    let sessions: Vec<HandledarSession> = sqlx::query_as(
        "SELECT * FROM handledar_sessions
         WHERE is_active = 1 AND date >= ? AND date <= ?
           AND participant_count < capacity
         ORDER BY date, start_time",
    )
    .bind(&from)
    .bind(&to)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(sessions)))
}

// ── Creation ──

/// Resolved slot for the booking being created: either the client's
/// requested lesson window or a group session's fixed window.
struct Slot {
    session_id: Option<i64>,
    date: String,
    start_time: String,
    end_time: String,
    duration_min: i64,
}

struct BookingDraft<'a> {
    user_id: Option<i64>,
    lesson_type_id: i64,
    slot: &'a Slot,
    transmission: Option<&'a str>,
    teacher_id: Option<i64>,
    status: &'a str,
    payment_status: &'a str,
    payment_method: Option<&'a str>,
    total_price: i64,
    guest_name: Option<&'a str>,
    guest_email: Option<&'a str>,
    guest_phone: Option<&'a str>,
    swish_reference: Option<&'a str>,
}

async fn insert_booking<'e, E>(exec: E, draft: &BookingDraft<'_>, now: &str) -> sqlx::Result<i64>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "INSERT INTO bookings
            (user_id, lesson_type_id, session_id, date, start_time, end_time,
             duration_min, transmission, teacher_id, status, payment_status,
             payment_method, total_price, guest_name, guest_email, guest_phone,
             swish_reference, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(draft.user_id)
    .bind(draft.lesson_type_id)
    .bind(draft.slot.session_id)
    .bind(&draft.slot.date)
    .bind(&draft.slot.start_time)
    .bind(&draft.slot.end_time)
    .bind(draft.slot.duration_min)
    .bind(draft.transmission)
    .bind(draft.teacher_id)
    .bind(draft.status)
    .bind(draft.payment_status)
    .bind(draft.payment_method)
    .bind(draft.total_price)
    .bind(draft.guest_name)
    .bind(draft.guest_email)
    .bind(draft.guest_phone)
    .bind(draft.swish_reference)
    .bind(now)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn fetch_booking(db: &SqlitePool, id: i64) -> Result<Booking, BookingError> {
    sqlx::query_as("SELECT * FROM bookings WHERE id = ? AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(BookingError::NotFound)
}

pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<CreateBookingResponse>), BookingError> {
    let actor = auth::actor_from_headers(&headers, &state.auth_secret);
    let response = create_booking_inner(&state, actor, req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// The full creation flow, separated from the axum extractor layer so
/// lifecycle tests can drive it directly.
pub async fn create_booking_inner(
    state: &AppState,
    actor: Option<Actor>,
    req: CreateBookingRequest,
) -> Result<CreateBookingResponse, BookingError> {
    let now = now_utc();
    let now_s = now.format(TIMESTAMP_FORMAT).to_string();

    let lesson_type: LessonType =
        sqlx::query_as("SELECT * FROM lesson_types WHERE id = ? AND is_active = 1")
            .bind(req.lesson_type_id)
            .fetch_optional(&state.db)
            .await?
            .ok_or_else(|| BookingError::Validation("Unknown lesson type".into()))?;

    let slot = resolve_slot(state, &lesson_type, &req).await?;
    validate_booking_date(state, &slot, lesson_type.kind == lesson_kind::LESSON, now).await?;

    // Privileged override: an admin or teacher booking on behalf of a
    // named student bypasses guest handling and payment collection.
    let privileged_for = match actor {
        Some(a) if a.role.is_privileged() => req.student_id,
        _ => None,
    };

    let user_id = match (privileged_for, actor) {
        (Some(student_id), _) => Some(student_id),
        (None, Some(a)) => Some(a.user_id),
        (None, None) => None,
    };

    // Guest email collision is checked before any insert so the client
    // can prompt a login instead of creating an orphan booking.
    if actor.is_none() && req.payment_method != payment_method::TEMP {
        let name = req.guest_name.as_deref().filter(|v| !v.is_empty());
        let phone = req.guest_phone.as_deref().filter(|v| !v.is_empty());
        let email = req.guest_email.as_deref().filter(|v| !v.is_empty());
        let (Some(_), Some(_), Some(email)) = (name, phone, email) else {
            return Err(BookingError::Validation(
                "Guest bookings require name, email and phone".into(),
            ));
        };
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&state.db)
            .await?;
        if existing.is_some() {
            return Err(BookingError::EmailExists(email.to_string()));
        }
    }

    // Group sessions are capacity-bounded, not slot-exclusive; only
    // regular lessons contend for teacher time.
    let mut teacher_id = None;
    if lesson_type.kind == lesson_kind::LESSON {
        ensure_slot_free(&state.db, &slot, now).await?;
        teacher_id = allocator::select_teacher(
            &state.db,
            &slot.date,
            &slot.start_time,
            &slot.end_time,
            now,
        )
        .await
        .map(|a| a.teacher_id);
    }

    if let Some(student_id) = privileged_for {
        return create_privileged(state, student_id, &lesson_type, &slot, teacher_id, &req, &now_s)
            .await;
    }

    match req.payment_method.as_str() {
        payment_method::CREDITS => {
            create_with_credits(state, actor, &lesson_type, &slot, teacher_id, &req, &now_s).await
        }
        payment_method::QLIRO => {
            create_with_qliro(state, user_id, &lesson_type, &slot, teacher_id, &req, &now_s).await
        }
        payment_method::SWISH | payment_method::PAY_AT_LOCATION => {
            create_on_hold(state, user_id, &lesson_type, &slot, teacher_id, &req, &now_s).await
        }
        payment_method::TEMP => {
            create_placeholder(state, user_id, &lesson_type, &slot, teacher_id, &req, &now_s).await
        }
        other => Err(BookingError::Validation(format!(
            "Unsupported payment method: {}",
            other
        ))),
    }
}

/// Resolve the booked window: a group session's fixed slot, or the
/// client-supplied lesson window.
async fn resolve_slot(
    state: &AppState,
    lesson_type: &LessonType,
    req: &CreateBookingRequest,
) -> Result<Slot, BookingError> {
    if lesson_type.kind == lesson_kind::HANDLEDAR {
        let Some(session_id) = req.session_id else {
            return Err(BookingError::SessionSelectionRequired);
        };
        let session: HandledarSession =
            sqlx::query_as("SELECT * FROM handledar_sessions WHERE id = ? AND is_active = 1")
                .bind(session_id)
                .fetch_optional(&state.db)
                .await?
                .ok_or_else(|| BookingError::Validation("Unknown session".into()))?;
        if session.participant_count >= session.capacity {
            return Err(BookingError::CapacityExceeded);
        }
        return Ok(Slot {
            session_id: Some(session.id),
            date: session.date,
            start_time: session.start_time,
            end_time: session.end_time,
            duration_min: lesson_type.duration_min,
        });
    }

    let (Some(date), Some(start), Some(end)) = (
        req.date.clone(),
        req.start_time.clone(),
        req.end_time.clone(),
    ) else {
        return Err(BookingError::Validation(
            "Lesson bookings require date, start time and end time".into(),
        ));
    };
    if chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_err() {
        return Err(BookingError::Validation("Invalid date".into()));
    }
    if start >= end {
        return Err(BookingError::Validation(
            "Start time must be before end time".into(),
        ));
    }
    Ok(Slot {
        session_id: None,
        date,
        start_time: start,
        end_time: end,
        duration_min: req.duration_min.unwrap_or(lesson_type.duration_min),
    })
}

/// Business-date rules: no past dates, the booking-opens-from threshold,
/// and admin blocked dates (all-day or time-range).
async fn validate_booking_date(
    state: &AppState,
    slot: &Slot,
    check_blocked: bool,
    now: NaiveDateTime,
) -> Result<(), BookingError> {
    let today = now.date().format("%Y-%m-%d").to_string();
    if slot.date < today {
        return Err(BookingError::Validation("Cannot book a past date".into()));
    }

    if let Ok(Some(opens_from)) = state.settings.booking_opens_from().await {
        if slot.date < opens_from {
            return Err(BookingError::Validation(
                "Bookings are not yet open for this date".into(),
            ));
        }
    }

    if !check_blocked {
        return Ok(());
    }

    let blocked: Vec<BlockedDate> = sqlx::query_as("SELECT * FROM blocked_dates WHERE date = ?")
        .bind(&slot.date)
        .fetch_all(&state.db)
        .await?;
    for block in blocked {
        let hits = block.all_day
            || match (block.start_time.as_deref(), block.end_time.as_deref()) {
                (Some(bs), Some(be)) => {
                    overlap::ranges_overlap(&slot.start_time, &slot.end_time, bs, be)
                }
                _ => false,
            };
        if hits {
            return Err(BookingError::DateBlocked(
                block
                    .reason
                    .unwrap_or_else(|| "This date is not bookable".into()),
            ));
        }
    }
    Ok(())
}

/// Strict same-date conflict check: young provisional holds still block.
async fn ensure_slot_free(
    db: &SqlitePool,
    slot: &Slot,
    now: NaiveDateTime,
) -> Result<(), BookingError> {
    let existing: Vec<Booking> =
        sqlx::query_as("SELECT * FROM bookings WHERE date = ? AND deleted_at IS NULL")
            .bind(&slot.date)
            .fetch_all(db)
            .await?;
    let windows: Vec<BookingWindow> = existing.iter().map(BookingWindow::from).collect();
    if overlap::any_booking_overlaps(&slot.start_time, &slot.end_time, &windows, false, now) {
        return Err(BookingError::Conflict);
    }
    Ok(())
}

async fn create_privileged(
    state: &AppState,
    student_id: i64,
    lesson_type: &LessonType,
    slot: &Slot,
    teacher_id: Option<i64>,
    req: &CreateBookingRequest,
    now_s: &str,
) -> Result<CreateBookingResponse, BookingError> {
    let total_price = if req.already_paid { req.total_price } else { 0 };
    let id = insert_booking(
        &state.db,
        &BookingDraft {
            user_id: Some(student_id),
            lesson_type_id: lesson_type.id,
            slot,
            transmission: req.transmission.as_deref(),
            teacher_id,
            status: booking_status::CONFIRMED,
            payment_status: payment_status::PAID,
            payment_method: Some(req.payment_method.as_str()),
            total_price,
            guest_name: None,
            guest_email: None,
            guest_phone: None,
            swish_reference: None,
        },
        now_s,
    )
    .await?;

    if let Some(session_id) = slot.session_id {
        claim_session_seat(&state.db, session_id).await?;
    }

    let booking = fetch_booking(&state.db, id).await?;
    state
        .notifier
        .dispatch(
            NotificationTrigger::BookingConfirmed,
            serde_json::json!({
                "booking_id": id,
                "date": slot.date,
                "start_time": slot.start_time,
                "end_time": slot.end_time,
            }),
        )
        .await;
    Ok(CreateBookingResponse {
        booking,
        message: "Booking created".into(),
        checkout_url: None,
    })
}

/// Credits path: balance check, unit decrement, booking insert and, for
/// group sessions, the seat claim all commit or roll back together.
async fn create_with_credits(
    state: &AppState,
    actor: Option<Actor>,
    lesson_type: &LessonType,
    slot: &Slot,
    teacher_id: Option<i64>,
    req: &CreateBookingRequest,
    now_s: &str,
) -> Result<CreateBookingResponse, BookingError> {
    let Some(actor) = actor else {
        return Err(BookingError::Unauthorized);
    };

    let mut tx = state.db.begin().await?;

    let balance = credits::has_credit(&mut tx, actor.user_id, lesson_type).await?;
    if balance <= 0 {
        return Err(BookingError::Validation(
            "No credits available for this lesson type".into(),
        ));
    }
    if !credits::consume_one(&mut tx, actor.user_id, lesson_type).await? {
        return Err(BookingError::Validation(
            "No credits available for this lesson type".into(),
        ));
    }

    let id = insert_booking(
        &mut *tx,
        &BookingDraft {
            user_id: Some(actor.user_id),
            lesson_type_id: lesson_type.id,
            slot,
            transmission: req.transmission.as_deref(),
            teacher_id,
            status: booking_status::CONFIRMED,
            payment_status: payment_status::PAID,
            payment_method: Some(payment_method::CREDITS),
            total_price: 0,
            guest_name: None,
            guest_email: None,
            guest_phone: None,
            swish_reference: None,
        },
        now_s,
    )
    .await?;

    if let Some(session_id) = slot.session_id {
        let claimed = sqlx::query(
            "UPDATE handledar_sessions SET participant_count = participant_count + 1
             WHERE id = ? AND participant_count < capacity",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            // Roll back the credit and the insert together.
            return Err(BookingError::CapacityExceeded);
        }
    }

    tx.commit().await?;

    let booking = fetch_booking(&state.db, id).await?;
    state
        .notifier
        .dispatch(
            NotificationTrigger::BookingConfirmed,
            serde_json::json!({
                "booking_id": id,
                "user_id": actor.user_id,
                "date": slot.date,
                "start_time": slot.start_time,
                "end_time": slot.end_time,
            }),
        )
        .await;
    Ok(CreateBookingResponse {
        booking,
        message: "Booking confirmed using your credits".into(),
        checkout_url: None,
    })
}

/// Gateway path: the booking is inserted as a provisional hold first, so
/// a checkout failure leaves a retryable reservation instead of nothing.
async fn create_with_qliro(
    state: &AppState,
    user_id: Option<i64>,
    lesson_type: &LessonType,
    slot: &Slot,
    teacher_id: Option<i64>,
    req: &CreateBookingRequest,
    now_s: &str,
) -> Result<CreateBookingResponse, BookingError> {
    let id = insert_booking(
        &state.db,
        &BookingDraft {
            user_id,
            lesson_type_id: lesson_type.id,
            slot,
            transmission: req.transmission.as_deref(),
            teacher_id,
            status: booking_status::TEMP,
            payment_status: payment_status::UNPAID,
            payment_method: Some(payment_method::QLIRO),
            total_price: lesson_type.price,
            guest_name: req.guest_name.as_deref(),
            guest_email: req.guest_email.as_deref(),
            guest_phone: req.guest_phone.as_deref(),
            swish_reference: None,
        },
        now_s,
    )
    .await?;

    let reference = format!("booking-{}", id);
    let return_url = format!(
        "{}/api/payments/qliro/return?reference={}",
        state.public_url.trim_end_matches('/'),
        reference
    );
    match state
        .qliro
        .get_or_create_checkout(
            lesson_type.price,
            &reference,
            &lesson_type.name,
            &return_url,
            OrderCorrelation::Booking(id),
        )
        .await
    {
        Ok(checkout) => {
            let booking = fetch_booking(&state.db, id).await?;
            Ok(CreateBookingResponse {
                booking,
                message: "Complete your payment at the checkout".into(),
                checkout_url: Some(checkout.checkout_url),
            })
        }
        Err(e) => {
            tracing::warn!("checkout unavailable for booking {}: {}", id, e);
            let booking = fetch_booking(&state.db, id).await?;
            Ok(CreateBookingResponse {
                booking,
                message: "Slot reserved; the payment page is temporarily unavailable".into(),
                checkout_url: None,
            })
        }
    }
}

/// Swish / pay-at-location path: held awaiting the confirmation step.
async fn create_on_hold(
    state: &AppState,
    user_id: Option<i64>,
    lesson_type: &LessonType,
    slot: &Slot,
    teacher_id: Option<i64>,
    req: &CreateBookingRequest,
    now_s: &str,
) -> Result<CreateBookingResponse, BookingError> {
    let reference = payment_reference();
    let id = insert_booking(
        &state.db,
        &BookingDraft {
            user_id,
            lesson_type_id: lesson_type.id,
            slot,
            transmission: req.transmission.as_deref(),
            teacher_id,
            status: booking_status::ON_HOLD,
            payment_status: payment_status::UNPAID,
            payment_method: Some(req.payment_method.as_str()),
            total_price: lesson_type.price,
            guest_name: req.guest_name.as_deref(),
            guest_email: req.guest_email.as_deref(),
            guest_phone: req.guest_phone.as_deref(),
            swish_reference: Some(&reference),
        },
        now_s,
    )
    .await?;

    let booking = fetch_booking(&state.db, id).await?;
    let message = if req.payment_method == payment_method::SWISH {
        format!(
            "Booking held for {} minutes. Pay with Swish using reference {} and confirm",
            HOLD_WINDOW_MINUTES, reference
        )
    } else {
        format!("Booking held for {} minutes", HOLD_WINDOW_MINUTES)
    };
    Ok(CreateBookingResponse {
        booking,
        message,
        checkout_url: None,
    })
}

/// Placeholder reservation while the client finishes the flow; swept
/// away by the hold expiry if never completed.
async fn create_placeholder(
    state: &AppState,
    user_id: Option<i64>,
    lesson_type: &LessonType,
    slot: &Slot,
    teacher_id: Option<i64>,
    req: &CreateBookingRequest,
    now_s: &str,
) -> Result<CreateBookingResponse, BookingError> {
    let id = insert_booking(
        &state.db,
        &BookingDraft {
            user_id,
            lesson_type_id: lesson_type.id,
            slot,
            transmission: req.transmission.as_deref(),
            teacher_id,
            status: booking_status::TEMP,
            payment_status: payment_status::UNPAID,
            payment_method: Some(payment_method::TEMP),
            total_price: lesson_type.price,
            guest_name: Some(req.guest_name.as_deref().unwrap_or("Temporary")),
            guest_email: Some(req.guest_email.as_deref().unwrap_or("orderid@guest.local")),
            guest_phone: Some(req.guest_phone.as_deref().unwrap_or("0000000000")),
            swish_reference: None,
        },
        now_s,
    )
    .await?;

    let booking = fetch_booking(&state.db, id).await?;
    Ok(CreateBookingResponse {
        booking,
        message: "Slot reserved".into(),
        checkout_url: None,
    })
}

async fn claim_session_seat(db: &SqlitePool, session_id: i64) -> Result<(), BookingError> {
    let claimed = sqlx::query(
        "UPDATE handledar_sessions SET participant_count = participant_count + 1
         WHERE id = ? AND participant_count < capacity",
    )
    .bind(session_id)
    .execute(db)
    .await?;
    if claimed.rows_affected() == 0 {
        return Err(BookingError::CapacityExceeded);
    }
    Ok(())
}

// ── Swish confirmation ──

pub async fn confirm_swish(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<BookingStatusResponse>>, BookingError> {
    let booking = fetch_booking(&state.db, id).await?;
    if booking.status != booking_status::ON_HOLD {
        return Err(BookingError::Validation(
            "This booking can no longer be confirmed".into(),
        ));
    }

    sqlx::query(
        "UPDATE bookings SET status = ?, payment_status = ?, payment_method = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(booking_status::BOOKED)
    .bind(payment_status::PENDING)
    .bind(payment_method::SWISH)
    .bind(now_string())
    .bind(id)
    .execute(&state.db)
    .await?;

    // Guest confirmations get an account so the booking survives into
    // their history. Promotion failure is logged, never surfaced.
    if booking.user_id.is_none() {
        if let Some(email) = booking.guest_email.as_deref().filter(|e| !e.is_empty()) {
            if let Err(e) = promote_guest(&state.db, id, email, &booking).await {
                tracing::warn!("guest promotion failed for booking {}: {:#}", id, e);
            }
        }
    }

    let base = state.public_url.trim_end_matches('/');
    state
        .notifier
        .dispatch(
            NotificationTrigger::SwishPaymentPending,
            serde_json::json!({
                "booking_id": id,
                "date": booking.date,
                "start_time": booking.start_time,
                "end_time": booking.end_time,
                "swish_reference": booking.swish_reference,
                "confirm_url": format!("{}/api/admin/bookings/{}/payment?action=confirm", base, id),
                "reject_url": format!("{}/api/admin/bookings/{}/payment?action=reject", base, id),
            }),
        )
        .await;

    Ok(Json(ApiResponse::success(BookingStatusResponse {
        status: booking_status::BOOKED.into(),
        payment_status: payment_status::PENDING.into(),
    })))
}

/// Reuse an account matching the guest email or create a student
/// account, then relink the booking.
async fn promote_guest(
    db: &SqlitePool,
    booking_id: i64,
    email: &str,
    booking: &Booking,
) -> anyhow::Result<()> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(db)
        .await?;

    let user_id = match existing {
        Some(id) => id,
        None => {
            let result = sqlx::query(
                "INSERT INTO users (email, name, phone, role, is_active, created_at)
                 VALUES (?, ?, ?, 'student', 1, ?)",
            )
            .bind(email)
            .bind(booking.guest_name.as_deref().unwrap_or("Guest"))
            .bind(booking.guest_phone.as_deref())
            .bind(now_string())
            .execute(db)
            .await?;
            result.last_insert_rowid()
        }
    };

    sqlx::query("UPDATE bookings SET user_id = ?, updated_at = ? WHERE id = ?")
        .bind(user_id)
        .bind(now_string())
        .bind(booking_id)
        .execute(db)
        .await?;
    Ok(())
}

// ── Client queries ──

pub async fn my_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<Booking>>>, BookingError> {
    let actor = auth::actor_from_headers(&headers, &state.auth_secret)
        .ok_or(BookingError::Unauthorized)?;
    let bookings: Vec<Booking> = sqlx::query_as(
        "SELECT * FROM bookings WHERE user_id = ? AND deleted_at IS NULL
         ORDER BY date DESC, start_time DESC",
    )
    .bind(actor.user_id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(bookings)))
}

pub async fn my_credits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<UserCredit>>>, BookingError> {
    let actor = auth::actor_from_headers(&headers, &state.auth_secret)
        .ok_or(BookingError::Unauthorized)?;
    let credits: Vec<UserCredit> =
        sqlx::query_as("SELECT * FROM user_credits WHERE user_id = ? ORDER BY id")
            .bind(actor.user_id)
            .fetch_all(&state.db)
            .await?;
    Ok(Json(ApiResponse::success(credits)))
}

pub async fn booking_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<BookingStatusResponse>>, BookingError> {
    let booking = fetch_booking(&state.db, id).await?;
    Ok(Json(ApiResponse::success(BookingStatusResponse {
        status: booking.status,
        payment_status: booking.payment_status,
    })))
}

pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<BookingStatusResponse>>, BookingError> {
    let actor = auth::actor_from_headers(&headers, &state.auth_secret)
        .ok_or(BookingError::Unauthorized)?;
    let booking = fetch_booking(&state.db, id).await?;

    let owns = booking.user_id == Some(actor.user_id);
    if !owns && !actor.role.is_privileged() {
        return Err(BookingError::Unauthorized);
    }
    if booking.status == booking_status::CANCELLED {
        return Ok(Json(ApiResponse::success(BookingStatusResponse {
            status: booking.status,
            payment_status: booking.payment_status,
        })));
    }

    release_booking(&state.db, &booking).await?;

    state
        .notifier
        .dispatch(
            NotificationTrigger::BookingCancelled,
            serde_json::json!({
                "booking_id": id,
                "date": booking.date,
                "start_time": booking.start_time,
            }),
        )
        .await;

    let updated = fetch_booking(&state.db, id).await?;
    Ok(Json(ApiResponse::success(BookingStatusResponse {
        status: updated.status,
        payment_status: updated.payment_status,
    })))
}

/// Cancel a booking, refund a credits payment, and give back a claimed
/// session seat. Shared by the client and admin cancellation paths.
pub async fn release_booking(db: &SqlitePool, booking: &Booking) -> Result<(), BookingError> {
    let mut tx = db.begin().await?;

    let mut new_payment_status = booking.payment_status.clone();
    if booking.payment_method.as_deref() == Some(payment_method::CREDITS)
        && booking.payment_status == payment_status::PAID
    {
        if let Some(user_id) = booking.user_id {
            let lesson_type: Option<LessonType> =
                sqlx::query_as("SELECT * FROM lesson_types WHERE id = ?")
                    .bind(booking.lesson_type_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(lesson_type) = lesson_type {
                if credits::restore_one(&mut tx, user_id, &lesson_type).await? {
                    new_payment_status = payment_status::REFUNDED.into();
                }
            }
        }
    }

    sqlx::query("UPDATE bookings SET status = ?, payment_status = ?, updated_at = ? WHERE id = ?")
        .bind(booking_status::CANCELLED)
        .bind(&new_payment_status)
        .bind(now_string())
        .bind(booking.id)
        .execute(&mut *tx)
        .await?;

    if booking.status == booking_status::CONFIRMED {
        if let Some(session_id) = booking.session_id {
            sqlx::query(
                "UPDATE handledar_sessions SET participant_count = participant_count - 1
                 WHERE id = ? AND participant_count > 0",
            )
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

// ── Stale-hold sweep ──

/// Soft-release provisional unpaid bookings older than the hold window.
/// The overlap check already ignores them before this runs; the sweep
/// keeps the table from accumulating dead holds.
pub async fn expire_stale_holds(db: &SqlitePool) {
    let cutoff = (now_utc() - chrono::Duration::minutes(HOLD_WINDOW_MINUTES))
        .format(TIMESTAMP_FORMAT)
        .to_string();
    match sqlx::query(
        "UPDATE bookings SET deleted_at = ?, updated_at = ?
         WHERE status IN (?, ?) AND payment_status = ?
           AND deleted_at IS NULL AND created_at < ?",
    )
    .bind(now_string())
    .bind(now_string())
    .bind(booking_status::TEMP)
    .bind(booking_status::ON_HOLD)
    .bind(payment_status::UNPAID)
    .bind(&cutoff)
    .execute(db)
    .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            tracing::info!("released {} expired booking holds", result.rows_affected());
        }
        Ok(_) => {}
        Err(e) => tracing::error!("stale hold sweep failed: {}", e),
    }
}

// ── Tests ──
