//! Admin surface: manual payment settlement, cancellations, the user
//! roster, blocked dates, availability windows, and the settings-cache
//! invalidation hook.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::auth;
use crate::handlers::booking::{self, BookingError};
use crate::models::{
    booking_status, payment_status, ApiError, ApiResponse, BlockedDate, Booking,
    BookingStatusResponse, BookingsQuery, CreateAvailabilityRequest, CreateBlockedDateRequest,
    PaymentActionQuery, TeacherAvailability, User,
};
use crate::notify::NotificationTrigger;
use crate::overlap::TIMESTAMP_FORMAT;
use crate::AppState;

fn now_string() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

fn db_err(e: sqlx::Error) -> Response {
    BookingError::from(e).into_response()
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ApiError::new(msg))).into_response()
}

// ── Manual payment settlement ──

/// POST /api/admin/bookings/{id}/payment?action=confirm|reject
///
/// Settles a `pending` payment reported out-of-band (Swish). The links
/// in the admin notification land here.
pub async fn payment_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<PaymentActionQuery>,
) -> Result<Json<ApiResponse<BookingStatusResponse>>, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;

    let booking: Booking =
        sqlx::query_as("SELECT * FROM bookings WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&state.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BookingError::NotFound.into_response())?;

    match query.action.as_str() {
        "confirm" => confirm_payment(&state, &booking).await,
        "reject" => reject_payment(&state, &booking).await,
        other => Err(bad_request(&format!("Unknown action: {}", other))),
    }
}

async fn confirm_payment(
    state: &AppState,
    booking: &Booking,
) -> Result<Json<ApiResponse<BookingStatusResponse>>, Response> {
    let updated = sqlx::query(
        "UPDATE bookings SET status = ?, payment_status = ?, updated_at = ?
         WHERE id = ? AND payment_status = ?",
    )
    .bind(booking_status::CONFIRMED)
    .bind(payment_status::PAID)
    .bind(now_string())
    .bind(booking.id)
    .bind(payment_status::PENDING)
    .execute(&state.db)
    .await
    .map_err(db_err)?;
    if updated.rows_affected() == 0 {
        return Err(bad_request("This booking is not awaiting confirmation"));
    }

    if let Some(session_id) = booking.session_id {
        let seat = sqlx::query(
            "UPDATE handledar_sessions SET participant_count = participant_count + 1
             WHERE id = ? AND participant_count < capacity",
        )
        .bind(session_id)
        .execute(&state.db)
        .await
        .map_err(db_err)?;
        if seat.rows_affected() == 0 {
            tracing::warn!(
                "confirmed booking {} exceeded session {} capacity",
                booking.id,
                session_id
            );
        }
    }

    state
        .notifier
        .dispatch(
            NotificationTrigger::PaymentConfirmed,
            serde_json::json!({
                "booking_id": booking.id,
                "date": booking.date,
                "start_time": booking.start_time,
            }),
        )
        .await;

    Ok(Json(ApiResponse::success(BookingStatusResponse {
        status: booking_status::CONFIRMED.into(),
        payment_status: payment_status::PAID.into(),
    })))
}

async fn reject_payment(
    state: &AppState,
    booking: &Booking,
) -> Result<Json<ApiResponse<BookingStatusResponse>>, Response> {
    let updated = sqlx::query(
        "UPDATE bookings SET status = ?, payment_status = ?, updated_at = ?
         WHERE id = ? AND payment_status = ?",
    )
    .bind(booking_status::CANCELLED)
    .bind(payment_status::FAILED)
    .bind(now_string())
    .bind(booking.id)
    .bind(payment_status::PENDING)
    .execute(&state.db)
    .await
    .map_err(db_err)?;
    if updated.rows_affected() == 0 {
        return Err(bad_request("This booking is not awaiting confirmation"));
    }

    state
        .notifier
        .dispatch(
            NotificationTrigger::PaymentRejected,
            serde_json::json!({
                "booking_id": booking.id,
                "date": booking.date,
                "start_time": booking.start_time,
            }),
        )
        .await;

    Ok(Json(ApiResponse::success(BookingStatusResponse {
        status: booking_status::CANCELLED.into(),
        payment_status: payment_status::FAILED.into(),
    })))
}

/// POST /api/admin/bookings/{id}/cancel
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<BookingStatusResponse>>, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;

    let booking: Booking =
        sqlx::query_as("SELECT * FROM bookings WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&state.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BookingError::NotFound.into_response())?;

    booking::release_booking(&state.db, &booking)
        .await
        .map_err(IntoResponse::into_response)?;

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

    Ok(Json(ApiResponse::success(BookingStatusResponse {
        status: booking_status::CANCELLED.into(),
        payment_status: booking.payment_status,
    })))
}

// ── Booking overview ──

pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BookingsQuery>,
) -> Result<Json<ApiResponse<Vec<Booking>>>, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;

    let bookings: Vec<Booking> = if let Some(date) = query.date {
        sqlx::query_as(
            "SELECT * FROM bookings WHERE date = ? AND deleted_at IS NULL
             ORDER BY start_time",
        )
        .bind(date)
        .fetch_all(&state.db)
        .await
        .map_err(db_err)?
    } else {
        let from = query.from.unwrap_or_else(|| "0000-01-01".into());
        let to = query.to.unwrap_or_else(|| "9999-12-31".into());
        sqlx::query_as(
            "SELECT * FROM bookings WHERE date >= ? AND date <= ? AND deleted_at IS NULL
             ORDER BY date, start_time",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&state.db)
        .await
        .map_err(db_err)?
    };

    Ok(Json(ApiResponse::success(bookings)))
}

// ── Users ──

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<User>>>, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;
    let users: Vec<User> = sqlx::query_as("SELECT * FROM users WHERE is_active = 1 ORDER BY id")
        .fetch_all(&state.db)
        .await
        .map_err(db_err)?;
    Ok(Json(ApiResponse::success(users)))
}

// ── Blocked dates ──

pub async fn list_blocked_dates(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<BlockedDate>>>, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;
    let dates: Vec<BlockedDate> = sqlx::query_as("SELECT * FROM blocked_dates ORDER BY date")
        .fetch_all(&state.db)
        .await
        .map_err(db_err)?;
    Ok(Json(ApiResponse::success(dates)))
}

pub async fn create_blocked_date(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateBlockedDateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BlockedDate>>), Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;

    if chrono::NaiveDate::parse_from_str(&req.date, "%Y-%m-%d").is_err() {
        return Err(bad_request("Invalid date"));
    }
    if !req.all_day && (req.start_time.is_none() || req.end_time.is_none()) {
        return Err(bad_request(
            "Time-range blocks require start and end times",
        ));
    }

    let id = sqlx::query(
        "INSERT INTO blocked_dates (date, all_day, start_time, end_time, reason)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&req.date)
    .bind(req.all_day)
    .bind(&req.start_time)
    .bind(&req.end_time)
    .bind(&req.reason)
    .execute(&state.db)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    let created: BlockedDate = sqlx::query_as("SELECT * FROM blocked_dates WHERE id = ?")
        .bind(id)
        .fetch_one(&state.db)
        .await
        .map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn delete_blocked_date(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;
    let deleted = sqlx::query("DELETE FROM blocked_dates WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(db_err)?;
    if deleted.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, Json(ApiError::new("Not found"))).into_response());
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Availability windows ──

pub async fn list_availability(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<TeacherAvailability>>>, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;
    let windows: Vec<TeacherAvailability> = sqlx::query_as(
        "SELECT * FROM teacher_availability WHERE is_active = 1
         ORDER BY teacher_id, weekday, start_time",
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_err)?;
    Ok(Json(ApiResponse::success(windows)))
}

pub async fn create_availability(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateAvailabilityRequest>,
) -> Result<(StatusCode, Json<ApiResponse<TeacherAvailability>>), Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;

    if !(0..=6).contains(&req.weekday) {
        return Err(bad_request("Weekday must be 0 (Sunday) through 6"));
    }
    if req.start_time >= req.end_time {
        return Err(bad_request("Start time must be before end time"));
    }

    let id = sqlx::query(
        "INSERT INTO teacher_availability (teacher_id, weekday, start_time, end_time, is_active)
         VALUES (?, ?, ?, ?, 1)",
    )
    .bind(req.teacher_id)
    .bind(req.weekday)
    .bind(&req.start_time)
    .bind(&req.end_time)
    .execute(&state.db)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    let created: TeacherAvailability =
        sqlx::query_as("SELECT * FROM teacher_availability WHERE id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await
            .map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn delete_availability(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;
    let updated = sqlx::query("UPDATE teacher_availability SET is_active = 0 WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(db_err)?;
    if updated.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, Json(ApiError::new("Not found"))).into_response());
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Settings cache ──

/// POST /api/admin/settings/invalidate — drop the cached gateway
/// credential bundle so edits take effect before the TTL lapses.
pub async fn invalidate_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<&'static str>>, Response> {
    auth::require_admin(&headers, &state.auth_secret).map_err(IntoResponse::into_response)?;
    state.settings.invalidate().await;
    Ok(Json(ApiResponse::success("invalidated")))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::db;
    use crate::notify::Notifier;
    use crate::qliro::QliroService;
    use crate::settings::{SettingsProvider, SETTINGS_TTL};
    use axum::http::header::AUTHORIZATION;
    use std::time::Instant;

    async fn test_state() -> Arc<AppState> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let settings = Arc::new(SettingsProvider::new(pool.clone(), SETTINGS_TTL));
        Arc::new(AppState {
            db: pool.clone(),
            auth_secret: "test-secret".into(),
            public_url: "http://localhost:8080".into(),
            notifier: Notifier::new(None),
            settings: settings.clone(),
            qliro: QliroService::new(pool, settings, "http://localhost:8080".into()),
            started_at: Instant::now(),
        })
    }

    fn admin_headers(state: &AppState) -> HeaderMap {
        let expires = chrono::Utc::now().timestamp() + 3600;
        let token = auth::mint_token(&state.auth_secret, 1, Role::Admin, expires);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {}", token).parse().unwrap());
        headers
    }

    async fn seed_pending_booking(state: &AppState) -> i64 {
        sqlx::query(
            "INSERT INTO lesson_types (name, kind, price, duration_min, is_active)
             VALUES ('Körlektion', 'lesson', 500, 60, 1)",
        )
        .execute(&state.db)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO bookings
                (lesson_type_id, date, start_time, end_time, duration_min, status,
                 payment_status, payment_method, total_price, created_at, updated_at)
             VALUES (1, '2030-06-03', '10:00', '11:00', 60, 'booked', 'pending',
                     'swish', 500, '2030-06-01 10:00:00', '2030-06-01 10:00:00')",
        )
        .execute(&state.db)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    #[tokio::test]
    async fn test_confirm_settles_pending_payment() {
        let state = test_state().await;
        let id = seed_pending_booking(&state).await;

        let resp = payment_action(
            State(state.clone()),
            admin_headers(&state),
            Path(id),
            Query(PaymentActionQuery {
                action: "confirm".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            resp.0.data.as_ref().unwrap().status,
            booking_status::CONFIRMED
        );

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(booking.payment_status, payment_status::PAID);
    }

    #[tokio::test]
    async fn test_reject_cancels_the_booking() {
        let state = test_state().await;
        let id = seed_pending_booking(&state).await;

        payment_action(
            State(state.clone()),
            admin_headers(&state),
            Path(id),
            Query(PaymentActionQuery {
                action: "reject".into(),
            }),
        )
        .await
        .unwrap();

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(booking.status, booking_status::CANCELLED);
        assert_eq!(booking.payment_status, payment_status::FAILED);
    }

    #[tokio::test]
    async fn test_settlement_requires_pending_payment() {
        let state = test_state().await;
        let id = seed_pending_booking(&state).await;
        sqlx::query("UPDATE bookings SET payment_status = 'unpaid' WHERE id = ?")
            .bind(id)
            .execute(&state.db)
            .await
            .unwrap();

        let result = payment_action(
            State(state.clone()),
            admin_headers(&state),
            Path(id),
            Query(PaymentActionQuery {
                action: "confirm".into(),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_settlement_requires_admin() {
        let state = test_state().await;
        let id = seed_pending_booking(&state).await;

        let result = payment_action(
            State(state.clone()),
            HeaderMap::new(),
            Path(id),
            Query(PaymentActionQuery {
                action: "confirm".into(),
            }),
        )
        .await;
        assert!(result.is_err());

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(booking.payment_status, payment_status::PENDING);
    }

    #[tokio::test]
    async fn test_user_roster_lists_active_accounts() {
        let state = test_state().await;
        sqlx::query(
            "INSERT INTO users (email, name, role, is_active) VALUES
                ('anna@example.com', 'Anna', 'student', 1),
                ('bert@example.com', 'Bert', 'teacher', 1),
                ('gone@example.com', 'Gone', 'student', 0)",
        )
        .execute(&state.db)
        .await
        .unwrap();

        let resp = list_users(State(state.clone()), admin_headers(&state))
            .await
            .unwrap();
        let users = resp.0.data.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].email, "anna@example.com");
        assert_eq!(users[1].role, "teacher");

        assert!(list_users(State(state.clone()), HeaderMap::new())
            .await
            .is_err());
    }
}
