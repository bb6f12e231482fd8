use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{course_from_row, encode_ts, SqliteTaskStore};
use crate::traits::{Course, CourseChange, CourseStore, RemoteCourse};

#[async_trait]
impl CourseStore for SqliteTaskStore {
    async fn upsert_course(
        &self,
        user_id: i64,
        course: &RemoteCourse,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CourseChange> {
        let existing = sqlx::query(
            "SELECT id, name, code FROM courses WHERE user_id = ? AND canvas_course_id = ?",
        )
        .bind(user_id)
        .bind(&course.id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO courses (user_id, canvas_course_id, name, code, \
                     created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(&course.id)
                .bind(&course.name)
                .bind(&course.code)
                .bind(encode_ts(now))
                .bind(encode_ts(now))
                .execute(&self.pool)
                .await?;
                Ok(CourseChange::Created)
            }
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let name: String = row.try_get("name")?;
                let code: Option<String> = row.try_get("code")?;
                if name == course.name && code == course.code {
                    return Ok(CourseChange::Unchanged);
                }
                sqlx::query("UPDATE courses SET name = ?, code = ?, updated_at = ? WHERE id = ?")
                    .bind(&course.name)
                    .bind(&course.code)
                    .bind(encode_ts(now))
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(CourseChange::Updated)
            }
        }
    }

    async fn list_courses(&self, user_id: i64) -> anyhow::Result<Vec<Course>> {
        let rows = sqlx::query(
            "SELECT id, user_id, canvas_course_id, name, code, is_active, created_at, updated_at
             FROM courses WHERE user_id = ? AND is_active = 1 ORDER BY name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(course_from_row).collect()
    }
}
