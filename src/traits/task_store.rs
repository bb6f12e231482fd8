use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{CanvasCredential, Course, NewUser, RemoteCourse, Task, User};
use crate::types::{ReminderWindow, Tier};

/// Outcome of a course upsert, for sync stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourseChange {
    Created,
    Updated,
    Unchanged,
}

/// A task pre-filtered into some window's tolerance band, joined with the
/// user fields the reminder job needs to gate and address the send.
#[derive(Debug, Clone)]
pub struct ReminderCandidate {
    pub task: Task,
    pub chat_id: String,
    pub tier: Tier,
    pub premium_expires_at: Option<DateTime<Utc>>,
    pub course_name: Option<String>,
}

/// User rows: identity, credential, subscription, and sync bookkeeping.
///
/// Every mutation is a single atomic statement; the store stays valid under
/// the data-model invariants even if the calling job dies right after.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_chat_id(&self, chat_id: &str) -> anyhow::Result<Option<User>>;

    async fn get_user(&self, user_id: i64) -> anyhow::Result<Option<User>>;

    async fn create_user(&self, new_user: &NewUser, now: DateTime<Utc>) -> anyhow::Result<User>;

    /// Store a freshly validated credential; clears the invalid flag.
    async fn update_credential(
        &self,
        user_id: i64,
        credential: &CanvasCredential,
        remote_user_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn mark_credential_invalid(&self, user_id: i64, now: DateTime<Utc>)
        -> anyhow::Result<()>;

    /// Set tier and expiry together. Premium requires an expiry; free clears
    /// it.
    async fn set_tier(
        &self,
        user_id: i64,
        tier: Tier,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn update_preferences(
        &self,
        user_id: i64,
        reminders_enabled: bool,
        weekly_digest_enabled: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn touch_last_sync(&self, user_id: i64, now: DateTime<Utc>) -> anyhow::Result<()>;

    /// Bump the monthly manual-task counter, resetting it first when the
    /// calendar month has rolled over since `month_reset_at`.
    async fn increment_manual_tasks(&self, user_id: i64, now: DateTime<Utc>)
        -> anyhow::Result<()>;

    /// Active users with a usable credential whose last sync is missing or
    /// older than `staleness`. Never-synced users come first.
    async fn list_users_due_for_sync(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> anyhow::Result<Vec<User>>;

    /// Active users whose stored tier is premium and whose expiry has passed
    /// (`expiry <= now`).
    async fn list_users_with_expired_premium(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<User>>;
}

/// Course rows: only ever added or updated, never soft-deleted, so historical
/// task references stay resolvable.
#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn upsert_course(
        &self,
        user_id: i64,
        course: &RemoteCourse,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CourseChange>;

    async fn list_courses(&self, user_id: i64) -> anyhow::Result<Vec<Course>>;
}

/// Task rows: the local mirror plus reminder markers.
#[async_trait]
pub trait TaskMirrorStore: Send + Sync {
    async fn get_task(&self, task_id: i64) -> anyhow::Result<Option<Task>>;

    /// Non-deleted tasks for a user, due soonest first.
    async fn list_active_tasks(&self, user_id: i64) -> anyhow::Result<Vec<Task>>;

    /// Create-or-revive a mirrored assignment keyed by
    /// (user, assignment id). On conflict the row is updated in place
    /// (title, due date, and course overwritten, soft-delete cleared) and
    /// the reminder markers are left untouched.
    async fn upsert_remote_task(
        &self,
        user_id: i64,
        course_id: Option<i64>,
        assignment_id: &str,
        title: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Overwrite title and due date only; markers and flags are preserved.
    async fn update_task_fields(
        &self,
        task_id: i64,
        title: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn soft_delete_task(&self, task_id: i64, now: DateTime<Utc>) -> anyhow::Result<()>;

    async fn mark_task_completed(&self, task_id: i64, now: DateTime<Utc>) -> anyhow::Result<()>;

    async fn create_manual_task(
        &self,
        user_id: i64,
        course_id: Option<i64>,
        title: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Task>;

    /// Persist one window's sent-marker. Monotonic: there is no operation
    /// that clears a marker short of deleting the row.
    async fn set_reminder_sent(
        &self,
        task_id: i64,
        window: ReminderWindow,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Tasks whose due date falls inside any window's tolerance band around
    /// `now`, scoped to active users with reminders enabled and to tasks that
    /// are neither completed nor soft-deleted.
    async fn list_reminder_candidates(
        &self,
        now: DateTime<Utc>,
        tolerance: Duration,
    ) -> anyhow::Result<Vec<ReminderCandidate>>;
}

/// Facade over the per-entity store traits; the jobs hold `Arc<dyn TaskStore>`.
pub trait TaskStore: UserStore + CourseStore + TaskMirrorStore {}

impl<T: UserStore + CourseStore + TaskMirrorStore> TaskStore for T {}
