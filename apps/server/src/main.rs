mod allocator;
mod auth;
mod credits;
mod db;
mod handlers;
mod models;
mod notify;
mod overlap;
mod qliro;
mod rate_limit;
mod settings;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use notify::Notifier;
use qliro::QliroService;
use rate_limit::{
    rate_limit_admin, rate_limit_booking, rate_limit_client, rate_limit_public, RateLimiter,
};
use settings::{SettingsProvider, SETTINGS_TTL};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub auth_secret: String,
    pub public_url: String,
    pub notifier: Notifier,
    pub settings: Arc<SettingsProvider>,
    pub qliro: QliroService,
    pub started_at: Instant,
}

/// Stale-hold sweep interval (seconds).
const HOLD_SWEEP_INTERVAL_SECS: u64 = 60;
/// Stale gateway-order sweep interval (seconds).
const ORDER_SWEEP_INTERVAL_SECS: u64 = 3600;
/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:trafikskola.db?mode=rwc".into());
    let auth_secret = std::env::var("AUTH_SECRET").expect("AUTH_SECRET must be set");
    let public_url =
        std::env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:3000".into());
    let notify_url = std::env::var("NOTIFY_URL").ok();

    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());

    if notify_url.is_none() {
        tracing::warn!("NOTIFY_URL not set — notification triggers will only be logged");
    }

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    db::run_migrations(&pool).await?;

    let settings = Arc::new(SettingsProvider::new(pool.clone(), SETTINGS_TTL));
    let state = Arc::new(AppState {
        db: pool.clone(),
        auth_secret,
        public_url: public_url.clone(),
        notifier: Notifier::new(notify_url),
        settings: settings.clone(),
        qliro: QliroService::new(pool, settings, public_url.clone()),
        started_at: Instant::now(),
    });

    // ── Background task: release expired booking holds ──
    let hold_db = state.db.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(HOLD_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            handlers::booking::expire_stale_holds(&hold_db).await;
        }
    });

    // ── Background task: expire stale gateway orders ──
    let order_db = state.db.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(ORDER_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            qliro::expire_stale_orders(&order_db).await;
        }
    });

    // ── Rate limiter + cleanup task ──
    let rate_limiter = RateLimiter::new();
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    // ── CORS: whitelist PUBLIC_URL when configured, otherwise allow any ──
    let cors = if public_url != "http://localhost:3000" {
        let origins: Vec<axum::http::HeaderValue> = vec![
            public_url.parse().expect("PUBLIC_URL must be a valid URL"),
            "http://localhost:5173".parse().unwrap(), // Vite dev server
        ];
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // ── Router (5 groups with per-group rate limits) ──

    // 1. No-limit: health + inbound payment callbacks
    let no_limit_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route(
            "/api/payments/qliro/webhook",
            post(handlers::payment::qliro_webhook),
        )
        .route(
            "/api/payments/qliro/return",
            get(handlers::payment::qliro_return),
        );

    // 2. Public: read-only catalogue (60 req/min)
    let public_routes = Router::new()
        .route(
            "/api/lesson-types",
            get(handlers::booking::list_lesson_types),
        )
        .route(
            "/api/handledar-sessions",
            get(handlers::booking::list_handledar_sessions),
        )
        .route(
            "/api/bookings/{id}/status",
            get(handlers::booking::booking_status),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_public));

    // 3. Booking creation + payment confirmation (10 req/min)
    let booking_routes = Router::new()
        .route("/api/bookings", post(handlers::booking::create_booking))
        .route(
            "/api/bookings/{id}/confirm-swish",
            post(handlers::booking::confirm_swish),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_booking));

    // 4. Authenticated client endpoints (30 req/min)
    let client_routes = Router::new()
        .route("/api/bookings/my", get(handlers::booking::my_bookings))
        .route("/api/credits/my", get(handlers::booking::my_credits))
        .route(
            "/api/bookings/{id}",
            delete(handlers::booking::cancel_booking),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_client));

    // 5. Admin endpoints (120 req/min)
    let admin_routes = Router::new()
        .route("/api/admin/bookings", get(handlers::admin::list_bookings))
        .route("/api/admin/users", get(handlers::admin::list_users))
        .route(
            "/api/admin/bookings/{id}/payment",
            post(handlers::admin::payment_action),
        )
        .route(
            "/api/admin/bookings/{id}/cancel",
            post(handlers::admin::cancel_booking),
        )
        .route(
            "/api/admin/blocked-dates",
            get(handlers::admin::list_blocked_dates).post(handlers::admin::create_blocked_date),
        )
        .route(
            "/api/admin/blocked-dates/{id}",
            delete(handlers::admin::delete_blocked_date),
        )
        .route(
            "/api/admin/availability",
            get(handlers::admin::list_availability).post(handlers::admin::create_availability),
        )
        .route(
            "/api/admin/availability/{id}",
            delete(handlers::admin::delete_availability),
        )
        .route(
            "/api/admin/settings/invalidate",
            post(handlers::admin::invalidate_settings),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_admin));

    let app = Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(client_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    tracing::info!("Trafikskola server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
