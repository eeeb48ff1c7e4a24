//! Prepaid credit ledger.
//!
//! Credits come in two shapes: tied to a specific lesson type, or generic
//! for a whole category (`credit_type` tag, e.g. any handledar session).
//! Consumption takes exactly one unit from one row and the UPDATE is
//! guarded so a balance can never go negative. Functions take a plain
//! connection so the booking lifecycle can run them inside its own
//! transaction.

use sqlx::SqliteConnection;

use crate::models::{lesson_kind, LessonType};

/// Total usable credits the user holds for this lesson type: rows bound
/// to the type itself, plus generic rows whose category tag matches.
pub async fn has_credit(
    conn: &mut SqliteConnection,
    user_id: i64,
    lesson_type: &LessonType,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(credits_remaining), 0) FROM user_credits
         WHERE user_id = ?
           AND (lesson_type_id = ? OR (lesson_type_id IS NULL AND credit_type = ?))",
    )
    .bind(user_id)
    .bind(lesson_type.id)
    .bind(category(lesson_type))
    .fetch_one(conn)
    .await
}

/// Deduct one credit from the first matching row with remaining balance.
/// Returns false when no row qualifies. Never splits a unit across rows.
pub async fn consume_one(
    conn: &mut SqliteConnection,
    user_id: i64,
    lesson_type: &LessonType,
) -> sqlx::Result<bool> {
    let row_id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM user_credits
         WHERE user_id = ? AND credits_remaining > 0
           AND (lesson_type_id = ? OR (lesson_type_id IS NULL AND credit_type = ?))
         ORDER BY id ASC LIMIT 1",
    )
    .bind(user_id)
    .bind(lesson_type.id)
    .bind(category(lesson_type))
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row_id) = row_id else {
        return Ok(false);
    };

    let result = sqlx::query(
        "UPDATE user_credits SET credits_remaining = credits_remaining - 1
         WHERE id = ? AND credits_remaining > 0",
    )
    .bind(row_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Give one credit back after a cancelled credits booking. Refills the
/// first matching row with headroom; capped at `credits_total`.
pub async fn restore_one(
    conn: &mut SqliteConnection,
    user_id: i64,
    lesson_type: &LessonType,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE user_credits SET credits_remaining = credits_remaining + 1
         WHERE id = (
             SELECT id FROM user_credits
             WHERE user_id = ? AND credits_remaining < credits_total
               AND (lesson_type_id = ? OR (lesson_type_id IS NULL AND credit_type = ?))
             ORDER BY id ASC LIMIT 1
         )",
    )
    .bind(user_id)
    .bind(lesson_type.id)
    .bind(category(lesson_type))
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// The generic-credit category a lesson type draws from.
fn category(lesson_type: &LessonType) -> &str {
    if lesson_type.kind == lesson_kind::HANDLEDAR {
        lesson_kind::HANDLEDAR
    } else {
        lesson_kind::LESSON
    }
}

// ── Tests ──
