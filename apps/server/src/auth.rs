//! Session-token validation.
//!
//! Authentication itself (login, password handling) lives in a separate
//! service; this server only validates the HMAC-signed bearer tokens it
//! mints. Token format: `<user_id>.<role>.<expires_at_unix>.<sig>` where
//! `sig = hex(HMAC-SHA256(secret, "<user_id>.<role>.<expires_at_unix>"))`.

use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::models::ApiError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// Teachers and admins may book on behalf of students.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

/// The authenticated identity acting on a request.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: i64,
    pub role: Role,
}

fn sign(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Mint a session token.
pub fn mint_token(secret: &str, user_id: i64, role: Role, expires_at: i64) -> String {
    let payload = format!("{}.{}.{}", user_id, role.as_str(), expires_at);
    let sig = sign(&payload, secret);
    format!("{}.{}", payload, sig)
}

/// Validate a token and extract the actor. Returns `None` on any
/// malformed, tampered or expired token.
pub fn validate_token(token: &str, secret: &str) -> Option<Actor> {
    let mut parts = token.splitn(4, '.');
    let user_id: i64 = parts.next()?.parse().ok()?;
    let role_str = parts.next()?;
    let expires_at: i64 = parts.next()?.parse().ok()?;
    let sig = parts.next()?;

    let payload = format!("{}.{}.{}", user_id, role_str, expires_at);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    let expected = hex::decode(sig).ok()?;
    mac.verify_slice(&expected).ok()?;

    if chrono::Utc::now().timestamp() >= expires_at {
        tracing::debug!("session token expired for user {}", user_id);
        return None;
    }

    let role = Role::parse(role_str)?;
    Some(Actor { user_id, role })
}

/// Resolve the optional actor from an `Authorization: Bearer <token>`
/// header. Absence is a valid outcome (guest request).
pub fn actor_from_headers(headers: &HeaderMap, secret: &str) -> Option<Actor> {
    let header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    validate_token(token, secret)
}

/// Require an admin actor, or produce the error response directly.
pub fn require_admin(
    headers: &HeaderMap,
    secret: &str,
) -> Result<Actor, (StatusCode, Json<ApiError>)> {
    let actor = actor_from_headers(headers, secret).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new("Missing or invalid session token")),
        )
    })?;
    if actor.role != Role::Admin {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ApiError::new("Admin access required")),
        ));
    }
    Ok(actor)
}

// ── Tests ──
