//! Inbound payment surface: the Qliro status webhook and the customer
//! return URL. Both funnel into the same transition so they stay
//! idempotent with each other.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{
    booking_status, order_status, payment_status, ApiError, ApiResponse, Booking,
    BookingStatusResponse, QliroOrder,
};
use crate::notify::NotificationTrigger;
use crate::overlap::TIMESTAMP_FORMAT;
use crate::qliro;
use crate::AppState;

/// Header carrying the HMAC of the raw webhook body.
const SIGNATURE_HEADER: &str = "x-qliro-signature";

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnQuery {
    pub reference: String,
}

#[derive(Debug, Serialize)]
pub struct ReturnResponse {
    pub order_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking: Option<BookingStatusResponse>,
}

/// POST /api/payments/qliro/webhook
///
/// Unknown orders get a 200 so the gateway does not retry forever;
/// anything failing authentication gets a 401 before the payload is
/// acted on.
pub async fn qliro_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let settings = match state.settings.qliro().await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("webhook settings load failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::UNAUTHORIZED;
    };
    if !qliro::verify_webhook_signature(signature, &body, &settings.webhook_secret) {
        tracing::warn!("webhook rejected: bad signature");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("webhook rejected: unparseable body: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    let reference = payload
        .get("MerchantReference")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let remote_status = payload
        .get("Status")
        .or_else(|| payload.get("CustomerCheckoutStatus"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let order = match state.qliro.find_by_reference(reference).await {
        Ok(Some(order)) => order,
        Ok(None) => {
            tracing::warn!("webhook for unknown order reference {}", reference);
            return StatusCode::OK;
        }
        Err(e) => {
            tracing::error!("webhook order lookup failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    // The push URL for this order carried its callback token; a signed
    // payload aimed at the wrong order is still rejected.
    if !token_matches(&order, query.token.as_deref()) {
        tracing::warn!("webhook rejected: callback token mismatch for order {}", order.id);
        return StatusCode::UNAUTHORIZED;
    }

    match apply_remote_status(&state, &order, remote_status).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!("webhook transition failed for order {}: {}", order.id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// GET /api/payments/qliro/return — the customer landing back from the
/// checkout. Polls the remote order and applies the same transition the
/// webhook would, so whichever arrives first wins and the other is a
/// no-op.
pub async fn qliro_return(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReturnQuery>,
) -> Result<Json<ApiResponse<ReturnResponse>>, (StatusCode, Json<ApiError>)> {
    let order = state
        .qliro
        .find_by_reference(&query.reference)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new("Unknown payment reference")),
            )
        })?;

    match state.qliro.fetch_order_status(&order).await {
        Ok(remote_status) => {
            apply_remote_status(&state, &order, &remote_status)
                .await
                .map_err(internal)?;
        }
        Err(e) => {
            // Leave the local state as-is; the webhook will settle it.
            tracing::warn!("return poll failed for order {}: {}", order.id, e);
        }
    }

    let order = state
        .qliro
        .find_by_reference(&query.reference)
        .await
        .map_err(internal)?
        .unwrap_or(order);

    let booking = match order.booking_id {
        Some(id) => sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?")
            .bind(id)
            .fetch_optional(&state.db)
            .await
            .map_err(internal)?
            .map(|b| BookingStatusResponse {
                status: b.status,
                payment_status: b.payment_status,
            }),
        None => None,
    };

    Ok(Json(ApiResponse::success(ReturnResponse {
        order_status: order.status,
        booking,
    })))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, Json<ApiError>) {
    tracing::error!("payment reconciliation failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new("Internal server error")),
    )
}

fn token_matches(order: &QliroOrder, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return false;
    };
    if token != order.callback_token {
        return false;
    }
    match chrono::NaiveDateTime::parse_from_str(&order.callback_expires_at, TIMESTAMP_FORMAT) {
        Ok(expires) => chrono::Utc::now().naive_utc() < expires,
        Err(_) => false,
    }
}

/// Apply a remote order status to the local order and its booking.
///
/// The order-row update is guarded on `pending`, so a second delivery
/// (or the webhook racing the return poll) changes nothing.
async fn apply_remote_status(
    state: &AppState,
    order: &QliroOrder,
    remote_status: &str,
) -> sqlx::Result<()> {
    let outcome = match remote_status {
        "Completed" | "Paid" | "PaymentProcessed" => order_status::PAID,
        "Refused" | "Cancelled" | "Error" => order_status::FAILED,
        other => {
            tracing::debug!("ignoring order {} status {}", order.id, other);
            return Ok(());
        }
    };

    let claimed = sqlx::query(
        "UPDATE qliro_orders SET status = ?, updated_at = datetime('now')
         WHERE id = ? AND status = ?",
    )
    .bind(outcome)
    .bind(order.id)
    .bind(order_status::PENDING)
    .execute(&state.db)
    .await?;
    if claimed.rows_affected() == 0 {
        return Ok(());
    }

    let Some(booking_id) = order.booking_id else {
        return Ok(());
    };
    let booking: Option<Booking> =
        sqlx::query_as("SELECT * FROM bookings WHERE id = ? AND deleted_at IS NULL")
            .bind(booking_id)
            .fetch_optional(&state.db)
            .await?;
    let Some(booking) = booking else {
        tracing::warn!("order {} paid but booking {} is gone", order.id, booking_id);
        return Ok(());
    };

    if outcome == order_status::PAID {
        sqlx::query(
            "UPDATE bookings SET status = ?, payment_status = ?, updated_at = datetime('now')
             WHERE id = ?",
        )
        .bind(booking_status::CONFIRMED)
        .bind(payment_status::PAID)
        .bind(booking_id)
        .execute(&state.db)
        .await?;

        if let Some(session_id) = booking.session_id {
            let seat = sqlx::query(
                "UPDATE handledar_sessions SET participant_count = participant_count + 1
                 WHERE id = ? AND participant_count < capacity",
            )
            .bind(session_id)
            .execute(&state.db)
            .await?;
            if seat.rows_affected() == 0 {
                tracing::warn!(
                    "paid booking {} exceeded session {} capacity",
                    booking_id,
                    session_id
                );
            }
        }

        state
            .notifier
            .dispatch(
                NotificationTrigger::PaymentConfirmed,
                serde_json::json!({
                    "booking_id": booking_id,
                    "order_id": order.id,
                    "amount": order.amount,
                }),
            )
            .await;
    } else {
        sqlx::query(
            "UPDATE bookings SET status = ?, payment_status = ?, updated_at = datetime('now')
             WHERE id = ?",
        )
        .bind(booking_status::CANCELLED)
        .bind(payment_status::FAILED)
        .bind(booking_id)
        .execute(&state.db)
        .await?;

        state
            .notifier
            .dispatch(
                NotificationTrigger::PaymentRejected,
                serde_json::json!({
                    "booking_id": booking_id,
                    "order_id": order.id,
                }),
            )
            .await;
    }
    Ok(())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::notify::Notifier;
    use crate::qliro::QliroService;
    use crate::settings::{SettingsProvider, SETTINGS_TTL};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use std::time::Instant;

    const HOOK_SECRET: &str = "hook-secret";

    async fn test_state() -> Arc<AppState> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        sqlx::query("INSERT INTO site_settings (key, value) VALUES ('qliro_webhook_secret', ?)")
            .bind(HOOK_SECRET)
            .execute(&pool)
            .await
            .unwrap();
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

    async fn seed_paid_pair(state: &AppState) -> (i64, i64) {
        sqlx::query(
            "INSERT INTO lesson_types (name, kind, price, duration_min, is_active)
             VALUES ('Körlektion', 'lesson', 500, 60, 1)",
        )
        .execute(&state.db)
        .await
        .unwrap();
        let booking_id = sqlx::query(
            "INSERT INTO bookings
                (lesson_type_id, date, start_time, end_time, duration_min, status,
                 payment_status, payment_method, total_price, created_at, updated_at)
             VALUES (1, '2030-06-03', '10:00', '11:00', 60, 'temp', 'unpaid',
                     'qliro', 500, '2030-06-01 10:00:00', '2030-06-01 10:00:00')",
        )
        .execute(&state.db)
        .await
        .unwrap()
        .last_insert_rowid();

        let expires = (chrono::Utc::now().naive_utc() + chrono::Duration::hours(24))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let order_id = sqlx::query(
            "INSERT INTO qliro_orders
                (booking_id, remote_order_id, merchant_reference, amount, status,
                 environment, callback_token, callback_expires_at, created_at, updated_at)
             VALUES (?, 'ord-1', 'booking-1', 500, 'pending', 'sandbox', 'tok-1', ?,
                     '2030-06-01 10:00:00', '2030-06-01 10:00:00')",
        )
        .bind(booking_id)
        .bind(&expires)
        .execute(&state.db)
        .await
        .unwrap()
        .last_insert_rowid();
        (booking_id, order_id)
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(HOOK_SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign(body).parse().unwrap());
        headers
    }

    async fn deliver(state: &Arc<AppState>, body: &str, token: Option<&str>) -> StatusCode {
        qliro_webhook(
            State(state.clone()),
            Query(WebhookQuery {
                token: token.map(String::from),
            }),
            signed_headers(body.as_bytes()),
            Bytes::from(body.to_string()),
        )
        .await
    }

    #[tokio::test]
    async fn test_completed_webhook_confirms_booking() {
        let state = test_state().await;
        let (booking_id, _) = seed_paid_pair(&state).await;

        let body = r#"{"MerchantReference":"booking-1","Status":"Completed"}"#;
        let code = deliver(&state, body, Some("tok-1")).await;
        assert_eq!(code, StatusCode::OK);

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(booking_id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(booking.status, booking_status::CONFIRMED);
        assert_eq!(booking.payment_status, payment_status::PAID);

        let order_state: String =
            sqlx::query_scalar("SELECT status FROM qliro_orders WHERE booking_id = ?")
                .bind(booking_id)
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(order_state, order_status::PAID);
    }

    #[tokio::test]
    async fn test_second_delivery_is_a_no_op() {
        let state = test_state().await;
        let (booking_id, _) = seed_paid_pair(&state).await;

        let body = r#"{"MerchantReference":"booking-1","Status":"Completed"}"#;
        assert_eq!(deliver(&state, body, Some("tok-1")).await, StatusCode::OK);

        // Cancel arriving after a settle must not flip the booking back.
        let cancel = r#"{"MerchantReference":"booking-1","Status":"Cancelled"}"#;
        assert_eq!(deliver(&state, cancel, Some("tok-1")).await, StatusCode::OK);

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(booking_id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(booking.status, booking_status::CONFIRMED);
        assert_eq!(booking.payment_status, payment_status::PAID);
    }

    #[tokio::test]
    async fn test_refused_webhook_fails_booking() {
        let state = test_state().await;
        let (booking_id, _) = seed_paid_pair(&state).await;

        let body = r#"{"MerchantReference":"booking-1","Status":"Refused"}"#;
        assert_eq!(deliver(&state, body, Some("tok-1")).await, StatusCode::OK);

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(booking_id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(booking.status, booking_status::CANCELLED);
        assert_eq!(booking.payment_status, payment_status::FAILED);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let state = test_state().await;
        seed_paid_pair(&state).await;

        let body = r#"{"MerchantReference":"booking-1","Status":"Completed"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign(b"something else").parse().unwrap());
        let code = qliro_webhook(
            State(state.clone()),
            Query(WebhookQuery {
                token: Some("tok-1".into()),
            }),
            headers,
            Bytes::from(body),
        )
        .await;
        assert_eq!(code, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_callback_token_is_rejected() {
        let state = test_state().await;
        let (booking_id, _) = seed_paid_pair(&state).await;

        let body = r#"{"MerchantReference":"booking-1","Status":"Completed"}"#;
        assert_eq!(
            deliver(&state, body, Some("wrong-token")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(deliver(&state, body, None).await, StatusCode::UNAUTHORIZED);

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(booking_id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(booking.status, booking_status::TEMP);
    }

    #[tokio::test]
    async fn test_unknown_order_returns_ok() {
        let state = test_state().await;
        let body = r#"{"MerchantReference":"no-such-order","Status":"Completed"}"#;
        assert_eq!(deliver(&state, body, Some("tok-1")).await, StatusCode::OK);
    }
}
