use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::{encode_ts, parse_opt_ts, task_from_row, SqliteTaskStore};
use crate::traits::{ReminderCandidate, Task, TaskMirrorStore};
use crate::types::{ReminderWindow, TaskOrigin, Tier};

const TASK_COLUMNS: &str = "id, user_id, course_id, canvas_assignment_id, canvas_event_id, \
     origin, title, due_at, is_completed, is_deleted, reminder_1w_sent, reminder_3d_sent, \
     reminder_24h_sent, reminder_8h_sent, reminder_2h_sent, reminder_1h_sent, \
     created_at, updated_at";

fn prefixed_task_columns(prefix: &str) -> String {
    TASK_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", prefix, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl TaskMirrorStore for SqliteTaskStore {
    async fn get_task(&self, task_id: i64) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_active_tasks(&self, user_id: i64) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE user_id = ? AND is_deleted = 0 ORDER BY due_at ASC",
            TASK_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn upsert_remote_task(
        &self,
        user_id: i64,
        course_id: Option<i64>,
        assignment_id: &str,
        title: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        // Reminder markers are deliberately absent from the update set: a
        // revived or re-mirrored row keeps whatever was already sent.
        sqlx::query(
            "INSERT INTO tasks (user_id, course_id, canvas_assignment_id, origin, title, \
             due_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, canvas_assignment_id) DO UPDATE SET
               title = excluded.title,
               due_at = excluded.due_at,
               course_id = excluded.course_id,
               is_deleted = 0,
               updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(assignment_id)
        .bind(TaskOrigin::RemoteAssignment.as_str())
        .bind(title)
        .bind(encode_ts(due_at))
        .bind(encode_ts(now))
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task_fields(
        &self,
        task_id: i64,
        title: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE tasks SET title = ?, due_at = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(encode_ts(due_at))
            .bind(encode_ts(now))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn soft_delete_task(&self, task_id: i64, now: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE tasks SET is_deleted = 1, updated_at = ? WHERE id = ?")
            .bind(encode_ts(now))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_task_completed(&self, task_id: i64, now: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE tasks SET is_completed = 1, updated_at = ? WHERE id = ?")
            .bind(encode_ts(now))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_manual_task(
        &self,
        user_id: i64,
        course_id: Option<i64>,
        title: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Task> {
        let result = sqlx::query(
            "INSERT INTO tasks (user_id, course_id, origin, title, due_at, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(TaskOrigin::Manual.as_str())
        .bind(title)
        .bind(encode_ts(due_at))
        .bind(encode_ts(now))
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await?;

        let task_id = result.last_insert_rowid();
        self.get_task(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {} vanished after insert", task_id))
    }

    async fn set_reminder_sent(
        &self,
        task_id: i64,
        window: ReminderWindow,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        // window.column() is a closed set of identifiers, safe to splice.
        sqlx::query(&format!(
            "UPDATE tasks SET {} = 1, updated_at = ? WHERE id = ?",
            window.column()
        ))
        .bind(encode_ts(now))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_reminder_candidates(
        &self,
        now: DateTime<Utc>,
        tolerance: Duration,
    ) -> anyhow::Result<Vec<ReminderCandidate>> {
        let mut bands = Vec::with_capacity(ReminderWindow::ALL.len());
        let mut bounds = Vec::with_capacity(ReminderWindow::ALL.len() * 2);
        for window in ReminderWindow::ALL {
            let target = now + Duration::hours(window.hours_before());
            bands.push("(t.due_at >= ? AND t.due_at <= ?)");
            bounds.push(encode_ts(target - tolerance));
            bounds.push(encode_ts(target + tolerance));
        }

        let sql = format!(
            "SELECT {}, u.chat_id, u.tier, u.premium_expires_at, c.name AS course_name
             FROM tasks t
             JOIN users u ON u.id = t.user_id
             LEFT JOIN courses c ON c.id = t.course_id
             WHERE t.is_deleted = 0 AND t.is_completed = 0
               AND u.is_active = 1 AND u.reminders_enabled = 1
               AND ({})
             ORDER BY t.due_at ASC",
            prefixed_task_columns("t"),
            bands.join(" OR ")
        );

        let mut query = sqlx::query(&sql);
        for bound in &bounds {
            query = query.bind(bound);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                Ok(ReminderCandidate {
                    task: task_from_row(row)?,
                    chat_id: row.try_get("chat_id")?,
                    tier: Tier::parse(&row.try_get::<String, _>("tier")?)?,
                    premium_expires_at: parse_opt_ts(row.try_get("premium_expires_at")?)?,
                    course_name: row.try_get("course_name")?,
                })
            })
            .collect()
    }
}
