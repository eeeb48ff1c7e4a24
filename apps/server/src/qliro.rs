//! Qliro checkout-order reconciliation.
//!
//! Wraps the remote merchant API behind idempotent create-or-fetch
//! semantics backed by the local `qliro_orders` table. Two lookups guard
//! creation (correlation id, then sanitized merchant reference), and a
//! "duplicate order" rejection from the remote side is recovered by
//! re-fetching what the concurrent winner created. The local table is a
//! best-effort idempotency aid, not a lock: duplicate remote orders are
//! a recognized, recovered-from failure mode.

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{order_status, QliroOrder};
use crate::overlap::TIMESTAMP_FORMAT;
use crate::settings::{QliroSettings, SettingsProvider};

type HmacSha256 = Hmac<Sha256>;

/// Remote calls abort after this long and surface as `Timeout`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Transient failures are retried this many times in total.
const RETRY_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
/// The gateway rejects merchant references longer than this.
const MERCHANT_REFERENCE_MAX: usize = 25;
/// Pending local orders older than this are swept to `expired`.
const ORDER_TTL_HOURS: i64 = 24;

// ── Errors ──

#[derive(Debug, Error)]
pub enum QliroError {
    #[error("qliro checkout is disabled")]
    Disabled,
    #[error("qliro request timed out")]
    Timeout,
    #[error("qliro network error: {0}")]
    Network(String),
    #[error("qliro rejected the order as a duplicate")]
    Duplicate,
    #[error("qliro api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected qliro response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl QliroError {
    /// Worth another attempt under the backoff policy.
    fn is_transient(&self) -> bool {
        match self {
            QliroError::Timeout | QliroError::Network(_) => true,
            QliroError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// ── Correlation ──

/// The local entity a checkout order pays for. Exactly one per order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCorrelation {
    Booking(i64),
    HandledarBooking(i64),
    PackagePurchase(i64),
}

impl OrderCorrelation {
    fn column(&self) -> &'static str {
        match self {
            OrderCorrelation::Booking(_) => "booking_id",
            OrderCorrelation::HandledarBooking(_) => "handledar_booking_id",
            OrderCorrelation::PackagePurchase(_) => "package_purchase_id",
        }
    }

    fn id(&self) -> i64 {
        match self {
            OrderCorrelation::Booking(id)
            | OrderCorrelation::HandledarBooking(id)
            | OrderCorrelation::PackagePurchase(id) => *id,
        }
    }

    /// Type prefix for hashed merchant references.
    fn prefix(&self) -> &'static str {
        match self {
            OrderCorrelation::Booking(_) => "B",
            OrderCorrelation::HandledarBooking(_) => "H",
            OrderCorrelation::PackagePurchase(_) => "P",
        }
    }
}

/// Outcome of `get_or_create_checkout`.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub checkout_id: String,
    pub checkout_url: String,
    pub merchant_reference: String,
    /// True when an existing order was returned instead of creating one.
    pub is_existing: bool,
}

#[derive(Debug, Clone)]
struct RemoteOrder {
    order_id: String,
    payment_link: Option<String>,
    status: String,
}

// ── Service ──

#[derive(Clone)]
pub struct QliroService {
    http: reqwest::Client,
    db: SqlitePool,
    settings: Arc<SettingsProvider>,
    public_url: String,
}

impl QliroService {
    pub fn new(db: SqlitePool, settings: Arc<SettingsProvider>, public_url: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("http client"),
            db,
            settings,
            public_url,
        }
    }

    /// Idempotent create-or-fetch of a checkout order for `correlation`.
    pub async fn get_or_create_checkout(
        &self,
        amount: i64,
        reference: &str,
        description: &str,
        return_url: &str,
        correlation: OrderCorrelation,
    ) -> Result<Checkout, QliroError> {
        let settings = self.settings.qliro().await?;
        if !settings.enabled {
            return Err(QliroError::Disabled);
        }

        // First idempotency check: the correlation id.
        if let Some(order) = self.find_by_correlation(&correlation).await? {
            match self.refresh(&settings, &order).await {
                Ok(checkout) => return Ok(checkout),
                Err(e) => tracing::warn!(
                    "stale local order {} could not be refreshed ({}); creating anew",
                    order.id,
                    e
                ),
            }
        }

        let merchant_reference = sanitize_merchant_reference(reference, correlation.prefix());

        // Second idempotency check: the stable merchant reference, covering
        // the case where the correlation linkage was lost.
        if let Some(order) = self.find_by_reference(&merchant_reference).await? {
            match self.refresh(&settings, &order).await {
                Ok(checkout) => return Ok(checkout),
                Err(e) => tracing::warn!(
                    "order {} for reference {} could not be refreshed ({}); creating anew",
                    order.id,
                    merchant_reference,
                    e
                ),
            }
        }

        let callback_token = random_token();
        let payload = self.order_payload(
            &merchant_reference,
            amount,
            description,
            return_url,
            &callback_token,
        );
        let body = serde_json::to_string(&payload)
            .map_err(|e| QliroError::InvalidResponse(e.to_string()))?;

        let created = match with_backoff("qliro create order", || {
            self.create_remote_order(&settings, &body)
        })
        .await
        {
            Ok(order) => order,
            // Two concurrent requests can both pass the lookups above and
            // both attempt creation; the loser recovers by fetching what
            // the winner created.
            Err(QliroError::Duplicate) => {
                tracing::warn!(
                    "duplicate order for reference {}; recovering via reference fetch",
                    merchant_reference
                );
                self.fetch_remote_by_reference(&settings, &merchant_reference)
                    .await?
            }
            Err(e) => return Err(e),
        };

        // The checkout already exists remotely; a failed local insert must
        // not invalidate it.
        if let Err(e) = self
            .persist_order(
                &correlation,
                &created,
                &merchant_reference,
                amount,
                &settings.environment,
                &callback_token,
            )
            .await
        {
            tracing::warn!(
                "checkout {} created but local order insert failed: {}",
                created.order_id,
                e
            );
        }

        // Confirmation re-fetch for the canonical payment link.
        let live = match self.fetch_remote_by_id(&settings, &created.order_id).await {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!(
                    "post-create fetch of order {} failed: {}; using creation response",
                    created.order_id,
                    e
                );
                created
            }
        };

        let checkout_url = live.payment_link.ok_or_else(|| {
            QliroError::InvalidResponse("created order carries no payment link".into())
        })?;

        Ok(Checkout {
            checkout_id: live.order_id,
            checkout_url,
            merchant_reference,
            is_existing: false,
        })
    }

    /// Poll the live status of a local order (return-URL reconciliation).
    pub async fn fetch_order_status(&self, order: &QliroOrder) -> Result<String, QliroError> {
        let settings = self.settings.qliro().await?;
        if !settings.enabled {
            return Err(QliroError::Disabled);
        }
        let remote_id = order.remote_order_id.as_deref().ok_or_else(|| {
            QliroError::InvalidResponse("local order has no remote order id".into())
        })?;
        let live = with_backoff("qliro fetch order", || {
            self.fetch_remote_by_id(&settings, remote_id)
        })
        .await?;
        Ok(live.status)
    }

    // ── Local order table ──

    async fn find_by_correlation(
        &self,
        correlation: &OrderCorrelation,
    ) -> Result<Option<QliroOrder>, QliroError> {
        let sql = format!(
            "SELECT * FROM qliro_orders WHERE {} = ? AND status != ?
             ORDER BY id DESC LIMIT 1",
            correlation.column()
        );
        Ok(sqlx::query_as::<_, QliroOrder>(&sql)
            .bind(correlation.id())
            .bind(order_status::EXPIRED)
            .fetch_optional(&self.db)
            .await?)
    }

    pub async fn find_by_reference(
        &self,
        merchant_reference: &str,
    ) -> Result<Option<QliroOrder>, QliroError> {
        Ok(sqlx::query_as::<_, QliroOrder>(
            "SELECT * FROM qliro_orders WHERE merchant_reference = ? AND status != ?
             ORDER BY id DESC LIMIT 1",
        )
        .bind(merchant_reference)
        .bind(order_status::EXPIRED)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn persist_order(
        &self,
        correlation: &OrderCorrelation,
        remote: &RemoteOrder,
        merchant_reference: &str,
        amount: i64,
        environment: &str,
        callback_token: &str,
    ) -> Result<(), QliroError> {
        let now = chrono::Utc::now().naive_utc();
        let expires = now + chrono::Duration::hours(ORDER_TTL_HOURS);
        let sql = format!(
            "INSERT INTO qliro_orders
                ({}, remote_order_id, merchant_reference, amount, payment_url,
                 status, environment, callback_token, callback_expires_at,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            correlation.column()
        );
        sqlx::query(&sql)
            .bind(correlation.id())
            .bind(&remote.order_id)
            .bind(merchant_reference)
            .bind(amount)
            .bind(&remote.payment_link)
            .bind(order_status::PENDING)
            .bind(environment)
            .bind(callback_token)
            .bind(expires.format(TIMESTAMP_FORMAT).to_string())
            .bind(now.format(TIMESTAMP_FORMAT).to_string())
            .bind(now.format(TIMESTAMP_FORMAT).to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Re-fetch a known order and return it as an existing checkout,
    /// refreshing the cached payment link when the remote one moved.
    async fn refresh(
        &self,
        settings: &QliroSettings,
        order: &QliroOrder,
    ) -> Result<Checkout, QliroError> {
        let remote_id = order.remote_order_id.as_deref().ok_or_else(|| {
            QliroError::InvalidResponse("local order has no remote order id".into())
        })?;
        let live = with_backoff("qliro fetch order", || {
            self.fetch_remote_by_id(settings, remote_id)
        })
        .await?;

        if live.payment_link.is_some() && live.payment_link != order.payment_url {
            sqlx::query(
                "UPDATE qliro_orders SET payment_url = ?, updated_at = datetime('now')
                 WHERE id = ?",
            )
            .bind(&live.payment_link)
            .bind(order.id)
            .execute(&self.db)
            .await?;
        }

        let checkout_url = live
            .payment_link
            .or_else(|| order.payment_url.clone())
            .ok_or_else(|| {
                QliroError::InvalidResponse("order carries no payment link".into())
            })?;

        Ok(Checkout {
            checkout_id: live.order_id,
            checkout_url,
            merchant_reference: order.merchant_reference.clone(),
            is_existing: true,
        })
    }

    // ── Remote API ──

    async fn create_remote_order(
        &self,
        settings: &QliroSettings,
        body: &str,
    ) -> Result<RemoteOrder, QliroError> {
        let url = format!(
            "{}/checkout/merchantapi/Orders",
            settings.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, auth_header(body, &settings.api_secret))
            .header("x-api-key", &settings.api_key)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(map_transport)?;
        parse_remote_order(&response_json(resp).await?)
    }

    async fn fetch_remote_by_id(
        &self,
        settings: &QliroSettings,
        order_id: &str,
    ) -> Result<RemoteOrder, QliroError> {
        let url = format!(
            "{}/checkout/merchantapi/Orders/{}",
            settings.base_url.trim_end_matches('/'),
            order_id
        );
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, auth_header("", &settings.api_secret))
            .header("x-api-key", &settings.api_key)
            .send()
            .await
            .map_err(map_transport)?;
        parse_remote_order(&response_json(resp).await?)
    }

    async fn fetch_remote_by_reference(
        &self,
        settings: &QliroSettings,
        merchant_reference: &str,
    ) -> Result<RemoteOrder, QliroError> {
        let url = format!(
            "{}/checkout/merchantapi/Orders?merchantReference={}",
            settings.base_url.trim_end_matches('/'),
            merchant_reference
        );
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, auth_header("", &settings.api_secret))
            .header("x-api-key", &settings.api_key)
            .send()
            .await
            .map_err(map_transport)?;
        parse_remote_order(&response_json(resp).await?)
    }

    /// Checkout order payload per the merchant API. Prices carry a 25%
    /// VAT split; the push URLs carry the per-order callback token so
    /// inbound webhooks can be bound to the order that spawned them.
    fn order_payload(
        &self,
        merchant_reference: &str,
        amount: i64,
        description: &str,
        return_url: &str,
        callback_token: &str,
    ) -> Value {
        let base = self.public_url.trim_end_matches('/');
        let push_url = format!(
            "{}/api/payments/qliro/webhook?token={}",
            base, callback_token
        );
        let price_ex_vat = (amount * 100) / 125;

        serde_json::json!({
            "MerchantReference": merchant_reference,
            "Currency": "SEK",
            "Country": "SE",
            "Language": "sv-se",
            "MerchantTermsUrl": format!("{}/terms", base),
            "MerchantConfirmationUrl": return_url,
            "MerchantCheckoutStatusPushUrl": push_url,
            "MerchantOrderManagementStatusPushUrl": push_url,
            "MerchantOrderValidationUrl": format!("{}/api/payments/qliro/validate", base),
            "PaymentMethods": {
                "Include": ["SWISH", "CREDIT_CARDS", "INVOICE"],
                "Exclude": []
            },
            "OrderItems": [{
                "MerchantReference": merchant_reference,
                "Description": description,
                "Type": "Product",
                "Quantity": 1,
                "PricePerItemIncVat": amount,
                "PricePerItemExVat": price_ex_vat
            }]
        })
    }
}

// ── Webhook signature ──

/// HMAC-SHA256 over the raw webhook body. Callers reject any payload
/// whose signature does not match before acting on its content.
pub fn verify_webhook_signature(signature: &str, raw_body: &[u8], webhook_secret: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

// ── Stale-order sweep ──

/// Mark `pending` orders older than the order TTL as `expired`.
pub async fn expire_stale_orders(db: &SqlitePool) {
    let cutoff = (chrono::Utc::now().naive_utc() - chrono::Duration::hours(ORDER_TTL_HOURS))
        .format(TIMESTAMP_FORMAT)
        .to_string();
    match sqlx::query(
        "UPDATE qliro_orders SET status = ?, updated_at = datetime('now')
         WHERE status = ? AND created_at < ?",
    )
    .bind(order_status::EXPIRED)
    .bind(order_status::PENDING)
    .bind(&cutoff)
    .execute(db)
    .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            tracing::info!("expired {} stale qliro orders", result.rows_affected());
        }
        Ok(_) => {}
        Err(e) => tracing::error!("stale order sweep failed: {}", e),
    }
}

// ── Helpers ──

/// Constrain a logical reference to the gateway's merchant-reference
/// format. Long or fully-stripped references collapse to a deterministic
/// type-prefixed hash so the same input always yields the same output.
pub fn sanitize_merchant_reference(reference: &str, prefix: &str) -> String {
    let cleaned: String = reference
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if !cleaned.is_empty() && cleaned.len() <= MERCHANT_REFERENCE_MAX {
        return cleaned;
    }

    let digest = Sha256::digest(reference.as_bytes());
    format!("{}-{}", prefix, hex::encode(&digest[..8]))
}

/// `Authorization: Qliro <base64(sha256(body + secret))>`.
fn auth_header(body: &str, api_secret: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", body, api_secret).as_bytes());
    format!(
        "Qliro {}",
        base64::engine::general_purpose::STANDARD.encode(digest)
    )
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn map_transport(e: reqwest::Error) -> QliroError {
    if e.is_timeout() {
        QliroError::Timeout
    } else {
        QliroError::Network(e.to_string())
    }
}

async fn response_json(resp: reqwest::Response) -> Result<Value, QliroError> {
    let status = resp.status();
    let text = resp.text().await.map_err(map_transport)?;

    if status.is_success() {
        return serde_json::from_str(&text).map_err(|e| QliroError::InvalidResponse(e.to_string()));
    }

    let error_code = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("ErrorCode").and_then(|c| c.as_str()).map(String::from));

    if status.as_u16() == 409 || error_code.as_deref() == Some("ORDER_ALREADY_EXISTS") {
        return Err(QliroError::Duplicate);
    }

    Err(QliroError::Api {
        status: status.as_u16(),
        body: text,
    })
}

fn parse_remote_order(json: &Value) -> Result<RemoteOrder, QliroError> {
    let order_id = match json.get("OrderId") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(QliroError::InvalidResponse(
                "response has no OrderId".into(),
            ))
        }
    };
    let payment_link = json
        .get("PaymentLink")
        .and_then(|v| v.as_str())
        .map(String::from);
    let status = json
        .get("CustomerCheckoutStatus")
        .and_then(|v| v.as_str())
        .unwrap_or("InProcess")
        .to_string();
    Ok(RemoteOrder {
        order_id,
        payment_link,
        status,
    })
}

async fn with_backoff<T, F, Fut>(op: &str, mut call: F) -> Result<T, QliroError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, QliroError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    op,
                    attempt,
                    RETRY_ATTEMPTS,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Tests ──
