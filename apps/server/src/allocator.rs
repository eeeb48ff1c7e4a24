//! Teacher allocation for new bookings.
//!
//! Two-pass algorithm: first only teachers whose weekly availability
//! window fully covers the requested range, then (when that yields
//! nobody, typically because availability data was never configured) a
//! relaxed pass that keeps only the conflict check. The relaxed outcome
//! is surfaced through `used_fallback` so operators can spot incomplete
//! availability configuration.
//!
//! "No teacher found" is not an error: the caller books without an
//! assignment. Data-access failures are logged here and also collapse
//! to `None` rather than failing the booking.

use chrono::{Datelike, NaiveDate};
use sqlx::SqlitePool;

use crate::models::booking_status;
use crate::overlap::{self, BookingWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub teacher_id: i64,
    pub used_fallback: bool,
}

/// Pick a teacher for `[start, end)` on `date`, or `None`.
pub async fn select_teacher(
    db: &SqlitePool,
    date: &str,
    start: &str,
    end: &str,
    now: chrono::NaiveDateTime,
) -> Option<Allocation> {
    match try_select(db, date, start, end, now).await {
        Ok(result) => {
            if let Some(a) = &result {
                if a.used_fallback {
                    tracing::warn!(
                        "teacher {} allocated via availability-agnostic fallback for {} {}-{}",
                        a.teacher_id,
                        date,
                        start,
                        end
                    );
                }
            }
            result
        }
        Err(e) => {
            tracing::error!("teacher allocation failed for {} {}-{}: {}", date, start, end, e);
            None
        }
    }
}

async fn try_select(
    db: &SqlitePool,
    date: &str,
    start: &str,
    end: &str,
    now: chrono::NaiveDateTime,
) -> sqlx::Result<Option<Allocation>> {
    let weekday = match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(d) => d.weekday().num_days_from_sunday() as i64,
        Err(_) => return Ok(None),
    };

    let teachers: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM users WHERE role = 'teacher' AND is_active = 1 ORDER BY id ASC",
    )
    .fetch_all(db)
    .await?;

    if teachers.is_empty() {
        return Ok(None);
    }
    // Single-teacher schools always succeed, no availability or conflict check.
    if teachers.len() == 1 {
        return Ok(Some(Allocation {
            teacher_id: teachers[0],
            used_fallback: false,
        }));
    }

    let mut strict = Vec::new();
    for &teacher_id in &teachers {
        let windows: Vec<(String, String)> = sqlx::query_as(
            "SELECT start_time, end_time FROM teacher_availability
             WHERE teacher_id = ? AND weekday = ? AND is_active = 1",
        )
        .bind(teacher_id)
        .bind(weekday)
        .fetch_all(db)
        .await?;

        let covered = windows
            .iter()
            .any(|(ws, we)| ws.as_str() <= start && end <= we.as_str());

        if covered && is_free(db, teacher_id, date, start, end, now).await? {
            strict.push(teacher_id);
        }
    }

    let (candidates, used_fallback) = if !strict.is_empty() {
        (strict, false)
    } else {
        let mut relaxed = Vec::new();
        for &teacher_id in &teachers {
            if is_free(db, teacher_id, date, start, end, now).await? {
                relaxed.push(teacher_id);
            }
        }
        (relaxed, true)
    };

    if candidates.is_empty() {
        return Ok(None);
    }

    // Least-loaded wins; discovery order breaks ties.
    let mut best: Option<(i64, i64)> = None;
    for &teacher_id in &candidates {
        let load: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bookings
             WHERE teacher_id = ? AND date = ? AND status != ? AND deleted_at IS NULL",
        )
        .bind(teacher_id)
        .bind(date)
        .bind(booking_status::CANCELLED)
        .fetch_one(db)
        .await?;

        if best.map_or(true, |(_, c)| load < c) {
            best = Some((teacher_id, load));
        }
    }

    Ok(best.map(|(teacher_id, _)| Allocation {
        teacher_id,
        used_fallback,
    }))
}

/// No active booking assigned to this teacher overlaps the range.
/// Expired provisional holds do not count as conflicts.
async fn is_free(
    db: &SqlitePool,
    teacher_id: i64,
    date: &str,
    start: &str,
    end: &str,
    now: chrono::NaiveDateTime,
) -> sqlx::Result<bool> {
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(
        "SELECT start_time, end_time, status, created_at FROM bookings
         WHERE teacher_id = ? AND date = ? AND status != ? AND deleted_at IS NULL",
    )
    .bind(teacher_id)
    .bind(date)
    .bind(booking_status::CANCELLED)
    .fetch_all(db)
    .await?;

    let windows: Vec<BookingWindow<'_>> = rows
        .iter()
        .map(|(s, e, st, c)| BookingWindow {
            start_time: s,
            end_time: e,
            status: st,
            created_at: c,
            deleted: false,
        })
        .collect();

    Ok(!overlap::any_booking_overlaps(start, end, &windows, false, now))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::overlap::TIMESTAMP_FORMAT;

    // 2026-03-02 is a Monday (weekday 1).
    const DATE: &str = "2026-03-02";

    fn now() -> chrono::NaiveDateTime {
        chrono::NaiveDateTime::parse_from_str("2026-03-01 12:00:00", TIMESTAMP_FORMAT).unwrap()
    }

    async fn pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO lesson_types (name, kind, price, duration_min)
             VALUES ('Körlektion', 'lesson', 500, 60)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    async fn add_teacher(pool: &SqlitePool, email: &str) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO users (email, name, role) VALUES (?, 'Lärare', 'teacher') RETURNING id",
        )
        .bind(email)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    async fn add_window(pool: &SqlitePool, teacher_id: i64, weekday: i64, start: &str, end: &str) {
        sqlx::query(
            "INSERT INTO teacher_availability (teacher_id, weekday, start_time, end_time)
             VALUES (?, ?, ?, ?)",
        )
        .bind(teacher_id)
        .bind(weekday)
        .bind(start)
        .bind(end)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn add_booking(
        pool: &SqlitePool,
        teacher_id: i64,
        start: &str,
        end: &str,
        status: &str,
        age_min: i64,
    ) {
        let created_at = (now() - chrono::Duration::minutes(age_min))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        sqlx::query(
            "INSERT INTO bookings (lesson_type_id, date, start_time, end_time, teacher_id,
                                   status, payment_status, created_at, updated_at)
             VALUES (1, ?, ?, ?, ?, ?, 'unpaid', ?, ?)",
        )
        .bind(DATE)
        .bind(start)
        .bind(end)
        .bind(teacher_id)
        .bind(status)
        .bind(&created_at)
        .bind(&created_at)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_no_teachers() {
        let pool = pool().await;
        assert!(select_teacher(&pool, DATE, "10:00", "11:00", now()).await.is_none());
    }

    #[tokio::test]
    async fn test_single_teacher_shortcut_ignores_everything() {
        let pool = pool().await;
        let t = add_teacher(&pool, "t1@skolan.se").await;
        // No availability window, and a directly conflicting confirmed booking.
        add_booking(&pool, t, "10:00", "11:00", "confirmed", 120).await;

        let allocation = select_teacher(&pool, DATE, "10:00", "11:00", now()).await.unwrap();
        assert_eq!(allocation.teacher_id, t);
        assert!(!allocation.used_fallback);
    }

    #[tokio::test]
    async fn test_availability_window_must_cover_range() {
        let pool = pool().await;
        let t1 = add_teacher(&pool, "t1@skolan.se").await;
        let t2 = add_teacher(&pool, "t2@skolan.se").await;
        add_window(&pool, t1, 1, "08:00", "12:00").await;
        add_window(&pool, t2, 1, "08:00", "10:30").await; // only partial cover

        let allocation = select_teacher(&pool, DATE, "10:00", "11:00", now()).await.unwrap();
        assert_eq!(allocation.teacher_id, t1);
        assert!(!allocation.used_fallback);
    }

    #[tokio::test]
    async fn test_conflicting_booking_excludes_teacher() {
        let pool = pool().await;
        let t1 = add_teacher(&pool, "t1@skolan.se").await;
        let t2 = add_teacher(&pool, "t2@skolan.se").await;
        add_window(&pool, t1, 1, "08:00", "16:00").await;
        add_window(&pool, t2, 1, "08:00", "16:00").await;
        add_booking(&pool, t1, "10:30", "11:30", "confirmed", 120).await;

        let allocation = select_teacher(&pool, DATE, "10:00", "11:00", now()).await.unwrap();
        assert_eq!(allocation.teacher_id, t2);
    }

    #[tokio::test]
    async fn test_expired_hold_does_not_exclude() {
        let pool = pool().await;
        let t1 = add_teacher(&pool, "t1@skolan.se").await;
        let t2 = add_teacher(&pool, "t2@skolan.se").await;
        add_window(&pool, t1, 1, "08:00", "16:00").await;
        add_window(&pool, t2, 1, "08:00", "16:00").await;
        // A stale hold on t1's slot no longer blocks it; with equal load
        // the tie goes to the first-discovered teacher.
        add_booking(&pool, t1, "10:00", "11:00", "temp", 25).await;
        add_booking(&pool, t2, "08:00", "09:00", "confirmed", 200).await;

        let allocation = select_teacher(&pool, DATE, "10:00", "11:00", now()).await.unwrap();
        assert_eq!(allocation.teacher_id, t1);
    }

    #[tokio::test]
    async fn test_least_loaded_wins() {
        let pool = pool().await;
        let t1 = add_teacher(&pool, "t1@skolan.se").await;
        let t2 = add_teacher(&pool, "t2@skolan.se").await;
        add_window(&pool, t1, 1, "08:00", "16:00").await;
        add_window(&pool, t2, 1, "08:00", "16:00").await;
        // t1 has 3 bookings elsewhere that day, t2 has 1.
        add_booking(&pool, t1, "08:00", "09:00", "confirmed", 300).await;
        add_booking(&pool, t1, "09:00", "10:00", "confirmed", 300).await;
        add_booking(&pool, t1, "13:00", "14:00", "confirmed", 300).await;
        add_booking(&pool, t2, "08:00", "09:00", "confirmed", 300).await;

        let allocation = select_teacher(&pool, DATE, "10:00", "11:00", now()).await.unwrap();
        assert_eq!(allocation.teacher_id, t2);
    }

    #[tokio::test]
    async fn test_fallback_when_no_availability_configured() {
        let pool = pool().await;
        let t1 = add_teacher(&pool, "t1@skolan.se").await;
        let _t2 = add_teacher(&pool, "t2@skolan.se").await;
        // No availability rows at all.
        let allocation = select_teacher(&pool, DATE, "10:00", "11:00", now()).await.unwrap();
        assert!(allocation.used_fallback);
        assert_eq!(allocation.teacher_id, t1);
    }

    #[tokio::test]
    async fn test_fallback_still_honours_conflicts() {
        let pool = pool().await;
        let t1 = add_teacher(&pool, "t1@skolan.se").await;
        let t2 = add_teacher(&pool, "t2@skolan.se").await;
        add_booking(&pool, t1, "10:00", "11:00", "confirmed", 120).await;

        let allocation = select_teacher(&pool, DATE, "10:00", "11:00", now()).await.unwrap();
        assert!(allocation.used_fallback);
        assert_eq!(allocation.teacher_id, t2);
    }

    #[tokio::test]
    async fn test_everyone_busy_returns_none() {
        let pool = pool().await;
        let t1 = add_teacher(&pool, "t1@skolan.se").await;
        let t2 = add_teacher(&pool, "t2@skolan.se").await;
        add_booking(&pool, t1, "10:00", "11:00", "confirmed", 120).await;
        add_booking(&pool, t2, "10:00", "11:00", "booked", 120).await;

        assert!(select_teacher(&pool, DATE, "10:00", "11:00", now()).await.is_none());
    }
}
