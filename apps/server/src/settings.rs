//! DB-backed site settings with a TTL cache.
//!
//! Gateway credentials and business thresholds live in the
//! `site_settings` table so admins can change them without a redeploy.
//! The provider is passed by `Arc` through `AppState`; `invalidate()`
//! forces a reload on the next read.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Default cache lifetime for settings reads.
pub const SETTINGS_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct QliroSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub webhook_secret: String,
    pub environment: String,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    qliro: QliroSettings,
    booking_opens_from: Option<String>,
}

pub struct SettingsProvider {
    db: SqlitePool,
    ttl: Duration,
    cache: RwLock<Option<(Instant, Snapshot)>>,
}

impl SettingsProvider {
    pub fn new(db: SqlitePool, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Drop the cached snapshot; the next read hits the database.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    pub async fn qliro(&self) -> sqlx::Result<QliroSettings> {
        Ok(self.snapshot().await?.qliro)
    }

    /// Earliest date (`YYYY-MM-DD`) bookings may be made for, if set.
    pub async fn booking_opens_from(&self) -> sqlx::Result<Option<String>> {
        Ok(self.snapshot().await?.booking_opens_from)
    }

    async fn snapshot(&self) -> sqlx::Result<Snapshot> {
        {
            let cache = self.cache.read().await;
            if let Some((loaded_at, snapshot)) = cache.as_ref() {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let snapshot = self.load().await?;
        *self.cache.write().await = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    async fn load(&self) -> sqlx::Result<Snapshot> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM site_settings")
                .fetch_all(&self.db)
                .await?;
        let map: HashMap<String, String> = rows.into_iter().collect();

        let get = |key: &str| map.get(key).cloned().unwrap_or_default();

        Ok(Snapshot {
            qliro: QliroSettings {
                enabled: map.get("qliro_enabled").map(|v| v == "true").unwrap_or(false),
                base_url: get("qliro_base_url"),
                api_key: get("qliro_api_key"),
                api_secret: get("qliro_api_secret"),
                webhook_secret: get("qliro_webhook_secret"),
                environment: map
                    .get("qliro_environment")
                    .cloned()
                    .unwrap_or_else(|| "sandbox".into()),
            },
            booking_opens_from: map.get("booking_opens_from").cloned(),
        })
    }
}

// ── Tests ──
