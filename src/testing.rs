//! Test infrastructure: MockGateway, MockDispatcher, and store setup helpers.
//!
//! Gives job tests a real SQLite store on a temp file plus scriptable
//! collaborators for the two external boundaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;

use crate::state::SqliteTaskStore;
use crate::traits::store_prelude::*;
use crate::traits::{
    CanvasCredential, Dispatcher, GatewayError, NewUser, RemoteAssignment, RemoteCourse,
    RemoteGateway, User, Validation,
};

pub async fn setup_test_store() -> (SqliteTaskStore, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let store = SqliteTaskStore::new(db_file.path().to_str().unwrap())
        .await
        .unwrap();
    (store, db_file)
}

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

/// A user with a linked, valid credential.
pub async fn seed_linked_user(store: &SqliteTaskStore, chat_id: &str, now: DateTime<Utc>) -> User {
    store
        .create_user(
            &NewUser {
                chat_id: chat_id.to_string(),
                canvas_token: Some(format!("token-{}", chat_id)),
                canvas_user_id: Some("remote-1".to_string()),
                canvas_base_url: Some("https://canvas.example.edu".to_string()),
            },
            now,
        )
        .await
        .unwrap()
}

pub fn remote_course(id: &str, name: &str) -> RemoteCourse {
    RemoteCourse {
        id: id.to_string(),
        name: name.to_string(),
        code: None,
    }
}

pub fn remote_assignment(
    id: &str,
    course_id: &str,
    title: &str,
    due_at: DateTime<Utc>,
) -> RemoteAssignment {
    RemoteAssignment {
        id: id.to_string(),
        course_id: course_id.to_string(),
        title: title.to_string(),
        due_at,
    }
}

// ---------------------------------------------------------------------------
// MockGateway
// ---------------------------------------------------------------------------

pub type SnapshotResult = Result<(Vec<RemoteCourse>, Vec<RemoteAssignment>), GatewayError>;

/// Scripted gateway. Each planned entry covers one full snapshot fetch
/// (courses + assignments); `fetches` counts fetch attempts, which is what
/// the rate-limit retry tests assert on.
pub struct MockGateway {
    plan: Mutex<VecDeque<SnapshotResult>>,
    pub fetches: AtomicU32,
}

impl MockGateway {
    pub fn new(plan: Vec<SnapshotResult>) -> Self {
        Self {
            plan: Mutex::new(plan.into()),
            fetches: AtomicU32::new(0),
        }
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn validate(&self, _credential: &CanvasCredential) -> Result<Validation, GatewayError> {
        Ok(Validation {
            valid: true,
            remote_user_id: Some("remote-1".to_string()),
            display_name: Some("Test Student".to_string()),
        })
    }

    async fn list_courses(
        &self,
        _credential: &CanvasCredential,
    ) -> Result<Vec<RemoteCourse>, GatewayError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut plan = self.plan.lock().await;
        if matches!(plan.front(), Some(Err(_))) {
            if let Some(Err(e)) = plan.pop_front() {
                return Err(e);
            }
        }
        match plan.front() {
            Some(Ok((courses, _))) => Ok(courses.clone()),
            _ => Err(GatewayError::Transient("mock plan exhausted".to_string())),
        }
    }

    async fn list_assignments(
        &self,
        _credential: &CanvasCredential,
    ) -> Result<Vec<RemoteAssignment>, GatewayError> {
        let mut plan = self.plan.lock().await;
        match plan.pop_front() {
            Some(Ok((_, assignments))) => Ok(assignments),
            Some(Err(e)) => Err(e),
            None => Err(GatewayError::Transient("mock plan exhausted".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// MockDispatcher
// ---------------------------------------------------------------------------

/// Records every delivery attempt; an optional script forces failures.
#[derive(Default)]
pub struct MockDispatcher {
    pub calls: Mutex<Vec<(String, String, bool)>>,
    script: Mutex<VecDeque<bool>>,
}

impl MockDispatcher {
    /// Every send succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends consume the script front-to-back; once exhausted they succeed.
    pub fn with_script(script: Vec<bool>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
        }
    }

    pub async fn delivered(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(_, _, ok)| *ok)
            .map(|(chat, body, _)| (chat.clone(), body.clone()))
            .collect()
    }

    pub async fn attempt_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn send_text(&self, chat_id: &str, body: &str) -> bool {
        let ok = self.script.lock().await.pop_front().unwrap_or(true);
        self.calls
            .lock()
            .await
            .push((chat_id.to_string(), body.to_string(), ok));
        ok
    }
}
