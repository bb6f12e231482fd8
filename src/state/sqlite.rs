use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::traits::{Course, ReminderFlags, Task, User};
use crate::types::{TaskOrigin, Tier};

mod courses;
mod tasks;
mod users;


/// Set restrictive file permissions (0600) on the database and WAL files.
fn set_db_file_permissions(db_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
        tracing::warn!("Failed to set permissions on {}: {}", db_path, e);
    }
    for suffix in &["-wal", "-shm"] {
        let path = format!("{}{}", db_path, suffix);
        if std::path::Path::new(&path).exists() {
            if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                tracing::warn!("Failed to set permissions on {}: {}", path, e);
            }
        }
    }
}

/// SQLite-backed task store. Constructed explicitly and passed around as
/// `Arc<dyn TaskStore>`; there is no global connection state.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        set_db_file_permissions(db_path);

        create_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Create tables and indexes. Safe to call on every startup: `IF NOT EXISTS`
/// where possible, best-effort `ALTER TABLE` for columns added after the
/// initial schema.
async fn create_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id TEXT NOT NULL UNIQUE,
            canvas_token TEXT,
            canvas_user_id TEXT,
            canvas_base_url TEXT,
            token_invalid INTEGER NOT NULL DEFAULT 0,
            tier TEXT NOT NULL DEFAULT 'free',
            premium_expires_at TEXT,
            reminders_enabled INTEGER NOT NULL DEFAULT 1,
            weekly_digest_enabled INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1,
            manual_tasks_this_month INTEGER NOT NULL DEFAULT 0,
            month_reset_at TEXT NOT NULL,
            last_sync_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_tier ON users(tier)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_users_sync
         ON users(last_sync_at) WHERE is_active = 1",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS courses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            canvas_course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(user_id, canvas_course_id),
            FOREIGN KEY (user_id) REFERENCES users(id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_courses_user ON courses(user_id, is_active)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            course_id INTEGER,
            canvas_assignment_id TEXT,
            canvas_event_id TEXT,
            origin TEXT NOT NULL,
            title TEXT NOT NULL,
            due_at TEXT NOT NULL,
            is_completed INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            reminder_1w_sent INTEGER NOT NULL DEFAULT 0,
            reminder_3d_sent INTEGER NOT NULL DEFAULT 0,
            reminder_24h_sent INTEGER NOT NULL DEFAULT 0,
            reminder_8h_sent INTEGER NOT NULL DEFAULT 0,
            reminder_2h_sent INTEGER NOT NULL DEFAULT 0,
            reminder_1h_sent INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(user_id, canvas_assignment_id),
            UNIQUE(user_id, canvas_event_id),
            FOREIGN KEY (user_id) REFERENCES users(id),
            FOREIGN KEY (course_id) REFERENCES courses(id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_user_due ON tasks(user_id, due_at)",
    )
    .execute(pool)
    .await?;

    // The reminder candidate query scans by due date over live tasks only.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_due_live
         ON tasks(due_at) WHERE is_deleted = 0 AND is_completed = 0",
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Row encoding/decoding. Timestamps are RFC 3339 UTC text; enum tags are
// decoded through their closed parsers so an unknown value surfaces as an
// error instead of a silently wrong row.
// ---------------------------------------------------------------------------

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn encode_opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(encode_ts)
}

pub(crate) fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("bad timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn user_from_row(row: &SqliteRow) -> anyhow::Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        canvas_token: row.try_get("canvas_token")?,
        canvas_user_id: row.try_get("canvas_user_id")?,
        canvas_base_url: row.try_get("canvas_base_url")?,
        token_invalid: row.try_get::<i64, _>("token_invalid")? != 0,
        tier: Tier::parse(&row.try_get::<String, _>("tier")?)?,
        premium_expires_at: parse_opt_ts(row.try_get("premium_expires_at")?)?,
        reminders_enabled: row.try_get::<i64, _>("reminders_enabled")? != 0,
        weekly_digest_enabled: row.try_get::<i64, _>("weekly_digest_enabled")? != 0,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        manual_tasks_this_month: row.try_get("manual_tasks_this_month")?,
        month_reset_at: parse_ts(&row.try_get::<String, _>("month_reset_at")?)?,
        last_sync_at: parse_opt_ts(row.try_get("last_sync_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

pub(crate) fn course_from_row(row: &SqliteRow) -> anyhow::Result<Course> {
    Ok(Course {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        canvas_course_id: row.try_get("canvas_course_id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

pub(crate) fn task_from_row(row: &SqliteRow) -> anyhow::Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        course_id: row.try_get("course_id")?,
        canvas_assignment_id: row.try_get("canvas_assignment_id")?,
        canvas_event_id: row.try_get("canvas_event_id")?,
        origin: TaskOrigin::parse(&row.try_get::<String, _>("origin")?)?,
        title: row.try_get("title")?,
        due_at: parse_ts(&row.try_get::<String, _>("due_at")?)?,
        is_completed: row.try_get::<i64, _>("is_completed")? != 0,
        is_deleted: row.try_get::<i64, _>("is_deleted")? != 0,
        sent: ReminderFlags {
            one_week: row.try_get::<i64, _>("reminder_1w_sent")? != 0,
            three_days: row.try_get::<i64, _>("reminder_3d_sent")? != 0,
            one_day: row.try_get::<i64, _>("reminder_24h_sent")? != 0,
            eight_hours: row.try_get::<i64, _>("reminder_8h_sent")? != 0,
            two_hours: row.try_get::<i64, _>("reminder_2h_sent")? != 0,
            one_hour: row.try_get::<i64, _>("reminder_1h_sent")? != 0,
        },
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}
