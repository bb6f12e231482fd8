use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ReminderWindow, TaskOrigin, Tier};

/// A registered user with an optional upstream credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Telegram chat id, stored as text.
    pub chat_id: String,
    pub canvas_token: Option<String>,
    pub canvas_user_id: Option<String>,
    pub canvas_base_url: Option<String>,
    /// Set when the upstream platform rejects the token; cleared on re-link.
    pub token_invalid: bool,
    pub tier: Tier,
    pub premium_expires_at: Option<DateTime<Utc>>,
    pub reminders_enabled: bool,
    pub weekly_digest_enabled: bool,
    pub is_active: bool,
    pub manual_tasks_this_month: i64,
    pub month_reset_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// The credential to sync with, if the user has linked one and it has not
    /// been flagged invalid.
    pub fn credential(&self) -> Option<CanvasCredential> {
        if self.token_invalid {
            return None;
        }
        match (&self.canvas_token, &self.canvas_base_url) {
            (Some(token), Some(base_url)) => Some(CanvasCredential {
                base_url: base_url.clone(),
                token: token.clone(),
            }),
            _ => None,
        }
    }
}

/// Fields for a new user row; everything else takes schema defaults.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub chat_id: String,
    pub canvas_token: Option<String>,
    pub canvas_user_id: Option<String>,
    pub canvas_base_url: Option<String>,
}

/// An opaque upstream credential: where to talk and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasCredential {
    pub base_url: String,
    pub token: String,
}

/// A mirrored upstream course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub user_id: i64,
    pub canvas_course_id: String,
    pub name: String,
    pub code: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-window sent-markers on a task. Monotonic: normal operation only ever
/// flips a marker to true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderFlags {
    pub one_week: bool,
    pub three_days: bool,
    pub one_day: bool,
    pub eight_hours: bool,
    pub two_hours: bool,
    pub one_hour: bool,
}

impl ReminderFlags {
    pub fn is_set(&self, window: ReminderWindow) -> bool {
        match window {
            ReminderWindow::OneWeek => self.one_week,
            ReminderWindow::ThreeDays => self.three_days,
            ReminderWindow::OneDay => self.one_day,
            ReminderWindow::EightHours => self.eight_hours,
            ReminderWindow::TwoHours => self.two_hours,
            ReminderWindow::OneHour => self.one_hour,
        }
    }

}

/// A tracked obligation: a mirrored assignment, a mirrored event, or a manual
/// entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub course_id: Option<i64>,
    pub canvas_assignment_id: Option<String>,
    pub canvas_event_id: Option<String>,
    pub origin: TaskOrigin,
    pub title: String,
    pub due_at: DateTime<Utc>,
    pub is_completed: bool,
    pub is_deleted: bool,
    pub sent: ReminderFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a task has slipped past its deadline without being completed.
pub fn is_overdue(task: &Task, now: DateTime<Utc>) -> bool {
    now > task.due_at && !task.is_completed
}

/// An upstream course as returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCourse {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
}

/// An upstream assignment as returned by the gateway. Records without a due
/// timestamp or not in a publishable state never reach this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAssignment {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub due_at: DateTime<Utc>,
}

/// Result of validating an upstream credential.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub remote_user_id: Option<String>,
    pub display_name: Option<String>,
}

/// Typed failures at the remote-gateway boundary.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Credential revoked or expired. Stop syncing the user and flag the
    /// token; never retried automatically.
    #[error("credential rejected by the remote platform")]
    AuthInvalid,
    /// Upstream rate limit hit. Callers may retry once after a backoff.
    #[error("remote platform rate limit exceeded")]
    RateLimited,
    /// Network or upstream outage; retry on the next scheduled run.
    #[error("transient gateway failure: {0}")]
    Transient(String),
}

/// Remote data gateway: fetches the upstream snapshot for one credential.
///
/// Implementations handle pagination internally and return a complete
/// snapshot or a typed error; partial results are never returned silently.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn validate(&self, credential: &CanvasCredential) -> Result<Validation, GatewayError>;

    async fn list_courses(
        &self,
        credential: &CanvasCredential,
    ) -> Result<Vec<RemoteCourse>, GatewayError>;

    async fn list_assignments(
        &self,
        credential: &CanvasCredential,
    ) -> Result<Vec<RemoteAssignment>, GatewayError>;
}

/// Outbound notification delivery. Failure is a boolean at this boundary,
/// never an error type.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send_text(&self, chat_id: &str, body: &str) -> bool;
}

mod task_store;
pub use task_store::*;

/// Import this in modules that call store-trait methods on concrete types.
///
/// `TaskStore` is a facade (supertrait) used for trait objects, but Rust still
/// requires the defining trait to be in scope for method-call syntax.
pub mod store_prelude {
    #![allow(unused_imports)]
    pub use super::{CourseStore, TaskMirrorStore, TaskStore, UserStore};
}
