use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::{encode_opt_ts, encode_ts, user_from_row, SqliteTaskStore};
use crate::subscription::month_rolled_over;
use crate::traits::{CanvasCredential, NewUser, User, UserStore};
use crate::types::Tier;

const USER_COLUMNS: &str = "id, chat_id, canvas_token, canvas_user_id, canvas_base_url, \
     token_invalid, tier, premium_expires_at, reminders_enabled, weekly_digest_enabled, \
     is_active, manual_tasks_this_month, month_reset_at, last_sync_at, created_at, updated_at";

/// First instant of the month containing `now`, for quota bookkeeping.
fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{Datelike, TimeZone};
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[async_trait]
impl UserStore for SqliteTaskStore {
    async fn get_user_by_chat_id(&self, chat_id: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE chat_id = ?",
            USER_COLUMNS
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn get_user(&self, user_id: i64) -> anyhow::Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn create_user(&self, new_user: &NewUser, now: DateTime<Utc>) -> anyhow::Result<User> {
        let now_str = encode_ts(now);
        let reset_str = encode_ts(month_start(now));

        let result = sqlx::query(
            "INSERT INTO users (chat_id, canvas_token, canvas_user_id, canvas_base_url, \
             month_reset_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new_user.chat_id)
        .bind(&new_user.canvas_token)
        .bind(&new_user.canvas_user_id)
        .bind(&new_user.canvas_base_url)
        .bind(&reset_str)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.pool)
        .await?;

        let user_id = result.last_insert_rowid();
        self.get_user(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} vanished after insert", user_id))
    }

    async fn update_credential(
        &self,
        user_id: i64,
        credential: &CanvasCredential,
        remote_user_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET canvas_token = ?, canvas_base_url = ?, canvas_user_id = ?, \
             token_invalid = 0, updated_at = ? WHERE id = ?",
        )
        .bind(&credential.token)
        .bind(&credential.base_url)
        .bind(remote_user_id)
        .bind(encode_ts(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_credential_invalid(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET token_invalid = 1, updated_at = ? WHERE id = ?")
            .bind(encode_ts(now))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_tier(
        &self,
        user_id: i64,
        tier: Tier,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if tier == Tier::Premium && expires_at.is_none() {
            anyhow::bail!("premium tier requires an expiry timestamp");
        }
        let expires_at = match tier {
            Tier::Premium => expires_at,
            Tier::Free => None,
        };

        sqlx::query(
            "UPDATE users SET tier = ?, premium_expires_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(tier.as_str())
        .bind(encode_opt_ts(expires_at))
        .bind(encode_ts(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_preferences(
        &self,
        user_id: i64,
        reminders_enabled: bool,
        weekly_digest_enabled: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET reminders_enabled = ?, weekly_digest_enabled = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(reminders_enabled as i64)
        .bind(weekly_digest_enabled as i64)
        .bind(encode_ts(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_last_sync(&self, user_id: i64, now: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET last_sync_at = ?, updated_at = ? WHERE id = ?")
            .bind(encode_ts(now))
            .bind(encode_ts(now))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_manual_tasks(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let row = sqlx::query("SELECT month_reset_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no user {}", user_id))?;
        let reset_at = super::parse_ts(&row.try_get::<String, _>("month_reset_at")?)?;

        if month_rolled_over(reset_at, now) {
            sqlx::query(
                "UPDATE users SET manual_tasks_this_month = 1, month_reset_at = ?, \
                 updated_at = ? WHERE id = ?",
            )
            .bind(encode_ts(month_start(now)))
            .bind(encode_ts(now))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE users SET manual_tasks_this_month = manual_tasks_this_month + 1, \
                 updated_at = ? WHERE id = ?",
            )
            .bind(encode_ts(now))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn list_users_due_for_sync(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> anyhow::Result<Vec<User>> {
        let cutoff = encode_ts(now - staleness);

        let rows = sqlx::query(&format!(
            "SELECT {} FROM users
             WHERE is_active = 1 AND token_invalid = 0 AND canvas_token IS NOT NULL
               AND (last_sync_at IS NULL OR last_sync_at <= ?)
             ORDER BY CASE WHEN last_sync_at IS NULL THEN 0 ELSE 1 END, last_sync_at ASC, id ASC",
            USER_COLUMNS
        ))
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(user_from_row).collect()
    }

    async fn list_users_with_expired_premium(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users
             WHERE is_active = 1 AND tier = 'premium'
               AND premium_expires_at IS NOT NULL AND premium_expires_at <= ?
             ORDER BY premium_expires_at ASC",
            USER_COLUMNS
        ))
        .bind(encode_ts(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(user_from_row).collect()
    }
}
