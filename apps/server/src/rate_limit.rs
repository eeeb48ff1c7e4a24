use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiError;

/// Request tiers, each with its own per-IP sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Read-only catalogue endpoints.
    Public,
    /// Authenticated client endpoints.
    Client,
    /// Booking creation and payment confirmation. Strictest, since each
    /// request can hold a slot.
    Booking,
    /// Admin endpoints.
    Admin,
}

impl Tier {
    fn config(self) -> TierConfig {
        match self {
            Tier::Public => TierConfig::per_minute(60),
            Tier::Client => TierConfig::per_minute(30),
            Tier::Booking => TierConfig::per_minute(10),
            Tier::Admin => TierConfig::per_minute(120),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TierConfig {
    max_requests: u32,
    window: Duration,
}

impl TierConfig {
    const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

/// In-memory per-IP sliding-window rate limiter.
///
/// Each tier tracks request timestamps per client IP; a request is
/// rejected when the window already holds the tier's maximum.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    hits: Arc<DashMap<(Tier, IpAddr), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            hits: Arc::new(DashMap::new()),
        }
    }

    /// `Ok(())` when allowed, `Err(retry_after_secs)` when limited.
    pub fn check(&self, tier: Tier, ip: IpAddr) -> Result<(), u64> {
        let config = tier.config();
        let now = Instant::now();
        let window_start = now - config.window;

        let mut entry = self.hits.entry((tier, ip)).or_insert_with(Vec::new);
        entry.retain(|t| *t > window_start);

        if entry.len() >= config.max_requests as usize {
            let oldest = entry[0];
            let retry_after = (oldest + config.window)
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        entry.push(now);
        Ok(())
    }

    /// Drop IPs whose last hit is older than twice their tier window.
    /// Run periodically from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.hits.retain(|(tier, _), timestamps| {
            let cutoff = tier.config().window * 2;
            timestamps.retain(|t| now.duration_since(*t) < cutoff);
            !timestamps.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Client IP from `X-Forwarded-For` (reverse proxy) or the socket address.
pub fn extract_client_ip(req: &Request) -> IpAddr {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

fn too_many_requests(retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(ApiError::new(format!(
            "Too many requests. Try again in {} seconds",
            retry_after
        ))),
    )
        .into_response()
}

async fn limit(
    limiter: RateLimiter,
    tier: Tier,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(tier, ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

pub async fn rate_limit_public(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limit(limiter, Tier::Public, req, next).await
}

pub async fn rate_limit_client(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limit(limiter, Tier::Client, req, next).await
}

pub async fn rate_limit_booking(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limit(limiter, Tier::Booking, req, next).await
}

pub async fn rate_limit_admin(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limit(limiter, Tier::Admin, req, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_allows_up_to_tier_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check(Tier::Booking, ip(1)).is_ok());
        }
        assert!(limiter.check(Tier::Booking, ip(1)).is_err());
    }

    #[test]
    fn test_retry_after_within_window() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.check(Tier::Booking, ip(1)).unwrap();
        }
        let retry_after = limiter.check(Tier::Booking, ip(1)).unwrap_err();
        assert!((1..=60).contains(&retry_after));
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.check(Tier::Booking, ip(1)).unwrap();
        }
        assert!(limiter.check(Tier::Booking, ip(1)).is_err());
        assert!(limiter.check(Tier::Booking, ip(2)).is_ok());
    }

    #[test]
    fn test_tiers_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.check(Tier::Booking, ip(1)).unwrap();
        }
        assert!(limiter.check(Tier::Booking, ip(1)).is_err());
        assert!(limiter.check(Tier::Public, ip(1)).is_ok());
    }

    #[test]
    fn test_cleanup_preserves_active_windows() {
        let limiter = RateLimiter::new();
        limiter.check(Tier::Client, ip(1)).unwrap();
        limiter.cleanup();
        // The hit is well within the window, so it must still count.
        for _ in 0..29 {
            limiter.check(Tier::Client, ip(1)).unwrap();
        }
        assert!(limiter.check(Tier::Client, ip(1)).is_err());
    }

    #[test]
    fn test_forwarded_for_takes_precedence() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req), "203.0.113.7".parse::<IpAddr>().unwrap());
    }
}
