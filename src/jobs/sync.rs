//! Mirror reconciliation: keep the local task mirror consistent with the
//! upstream snapshot, one user at a time.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::traits::store_prelude::*;
use crate::traits::{
    CanvasCredential, CourseChange, GatewayError, RemoteAssignment, RemoteCourse, RemoteGateway,
    TaskStore, User,
};
use crate::types::TaskOrigin;

/// Per-user reconciliation result.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub courses_added: u64,
    pub courses_updated: u64,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

impl SyncOutcome {
    fn absorb(&mut self, other: SyncOutcome) {
        self.courses_added += other.courses_added;
        self.courses_updated += other.courses_updated;
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
    }
}

/// Whole-cycle totals across users.
#[derive(Debug, Default)]
pub struct SyncStats {
    pub users_processed: u64,
    pub users_failed: u64,
    pub tokens_invalidated: u64,
    pub totals: SyncOutcome,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

async fn fetch_once(
    gateway: &dyn RemoteGateway,
    credential: &CanvasCredential,
) -> Result<(Vec<RemoteCourse>, Vec<RemoteAssignment>), GatewayError> {
    let courses = gateway.list_courses(credential).await?;
    let assignments = gateway.list_assignments(credential).await?;
    Ok((courses, assignments))
}

/// Fetch the full snapshot. On a rate limit, back off once and retry the
/// whole fetch exactly once; a second rate limit surfaces as transient.
async fn fetch_snapshot(
    gateway: &dyn RemoteGateway,
    credential: &CanvasCredential,
    backoff: Duration,
) -> Result<(Vec<RemoteCourse>, Vec<RemoteAssignment>), GatewayError> {
    match fetch_once(gateway, credential).await {
        Err(GatewayError::RateLimited) => {
            warn!("Upstream rate limit hit; backing off before the single retry");
            tokio::time::sleep(backoff).await;
            match fetch_once(gateway, credential).await {
                Err(GatewayError::RateLimited) => Err(GatewayError::Transient(
                    "still rate limited after one retry".to_string(),
                )),
                other => other,
            }
        }
        other => other,
    }
}

/// Three-way diff between the upstream snapshot and the local mirror for one
/// user: create what's new, overwrite title/due where drifted, soft-delete
/// what disappeared. Courses are only ever added or updated.
///
/// On `AuthInvalid` the credential is flagged and the mirror is left
/// untouched.
pub async fn reconcile_user(
    store: &dyn TaskStore,
    gateway: &dyn RemoteGateway,
    user: &User,
    now: DateTime<Utc>,
    backoff: Duration,
) -> Result<SyncOutcome, SyncError> {
    let credential = user.credential().ok_or_else(|| {
        SyncError::Store(anyhow::anyhow!("user {} has no usable credential", user.id))
    })?;

    let (remote_courses, remote_assignments) =
        match fetch_snapshot(gateway, &credential, backoff).await {
            Ok(snapshot) => snapshot,
            Err(GatewayError::AuthInvalid) => {
                warn!(user_id = user.id, "Credential rejected upstream; flagging");
                store.mark_credential_invalid(user.id, now).await?;
                return Err(SyncError::Gateway(GatewayError::AuthInvalid));
            }
            Err(e) => return Err(e.into()),
        };

    let mut outcome = SyncOutcome::default();

    // Courses first, so task rows can always resolve their course.
    for course in &remote_courses {
        match store.upsert_course(user.id, course, now).await? {
            CourseChange::Created => outcome.courses_added += 1,
            CourseChange::Updated => outcome.courses_updated += 1,
            CourseChange::Unchanged => {}
        }
    }
    let course_ids: HashMap<String, i64> = store
        .list_courses(user.id)
        .await?
        .into_iter()
        .map(|c| (c.canvas_course_id, c.id))
        .collect();

    let mirrored: HashMap<String, crate::traits::Task> = store
        .list_active_tasks(user.id)
        .await?
        .into_iter()
        .filter(|t| t.origin == TaskOrigin::RemoteAssignment)
        .filter_map(|t| t.canvas_assignment_id.clone().map(|id| (id, t)))
        .collect();
    let snapshot: HashMap<&str, &RemoteAssignment> = remote_assignments
        .iter()
        .map(|a| (a.id.as_str(), a))
        .collect();

    // Added: upstream ids with no live mirror row. The upsert also revives
    // a soft-deleted row under the same correlation id.
    for (id, assignment) in &snapshot {
        if mirrored.contains_key(*id) {
            continue;
        }
        let course_id = course_ids.get(&assignment.course_id).copied();
        store
            .upsert_remote_task(
                user.id,
                course_id,
                id,
                &assignment.title,
                assignment.due_at,
                now,
            )
            .await?;
        outcome.added += 1;
    }

    // Updated / removed over the mirrored set.
    for (id, task) in &mirrored {
        match snapshot.get(id.as_str()) {
            Some(assignment) => {
                if task.title != assignment.title || task.due_at != assignment.due_at {
                    store
                        .update_task_fields(task.id, &assignment.title, assignment.due_at, now)
                        .await?;
                    outcome.updated += 1;
                }
            }
            None => {
                store.soft_delete_task(task.id, now).await?;
                outcome.removed += 1;
            }
        }
    }

    store.touch_last_sync(user.id, now).await?;
    Ok(outcome)
}

/// Sync every user due for a refresh, strictly sequentially, with a fixed
/// pause between users to stay under the upstream rate limit. One user's
/// failure never stops the batch.
pub async fn run_sync_cycle(
    store: &dyn TaskStore,
    gateway: &dyn RemoteGateway,
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<SyncStats> {
    let staleness = chrono::Duration::seconds(config.staleness_threshold_secs as i64);
    let users = store.list_users_due_for_sync(now, staleness).await?;

    let mut stats = SyncStats::default();
    if users.is_empty() {
        info!("No users due for sync");
        return Ok(stats);
    }
    info!(count = users.len(), "Starting sync cycle");

    let delay = Duration::from_millis(config.inter_user_delay_ms);
    let backoff = Duration::from_secs(config.rate_limit_backoff_secs);

    for (i, user) in users.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        match reconcile_user(store, gateway, user, now, backoff).await {
            Ok(outcome) => {
                stats.users_processed += 1;
                stats.totals.absorb(outcome);
            }
            Err(SyncError::Gateway(GatewayError::AuthInvalid)) => {
                stats.users_failed += 1;
                stats.tokens_invalidated += 1;
            }
            Err(e) => {
                warn!(user_id = user.id, "Sync failed for user: {}", e);
                stats.users_failed += 1;
            }
        }
    }

    info!(
        processed = stats.users_processed,
        failed = stats.users_failed,
        added = stats.totals.added,
        updated = stats.totals.updated,
        removed = stats.totals.removed,
        "Sync cycle complete"
    );
    Ok(stats)
}
