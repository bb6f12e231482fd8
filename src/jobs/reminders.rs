//! Tiered reminder dispatch.
//!
//! At most one notification per task per run: entitled windows are walked
//! furthest-out first and the first matching unsent window gets the single
//! dispatch attempt. Idempotence across overlapping or repeated runs rests
//! entirely on the persisted sent-markers, never on in-process state.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::channels::formatting;
use crate::subscription::{entitled_windows, SubscriptionState};
use crate::traits::store_prelude::*;
use crate::traits::{Dispatcher, ReminderCandidate, TaskStore};
use crate::types::ReminderWindow;

#[derive(Debug, Default)]
pub struct ReminderStats {
    pub tasks_checked: u64,
    pub sent: u64,
    pub failed: u64,
    pub users_notified: u64,
    /// Sends per window label, mirroring what the logs summarize.
    pub by_window: BTreeMap<&'static str, u64>,
}

/// The window to fire for one candidate, if any: the furthest-out entitled
/// window that is unsent and whose target time is within tolerance of `now`.
fn due_window(
    candidate: &ReminderCandidate,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Option<ReminderWindow> {
    let state = SubscriptionState::derive(candidate.tier, candidate.premium_expires_at, now);
    for window in entitled_windows(state) {
        if candidate.task.sent.is_set(*window) {
            continue;
        }
        let target = candidate.task.due_at - Duration::hours(window.hours_before());
        if (now - target).abs() <= tolerance {
            return Some(*window);
        }
    }
    None
}

/// Scan for tasks crossing a notification boundary and dispatch their
/// reminders. Safe to invoke repeatedly within the same tolerance band: a
/// window is only attempted while its persisted marker is still clear, and
/// the marker is only set after a confirmed dispatch.
pub async fn dispatch_due_reminders(
    store: &dyn TaskStore,
    dispatcher: &dyn Dispatcher,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> anyhow::Result<ReminderStats> {
    let candidates = store.list_reminder_candidates(now, tolerance).await?;

    let mut stats = ReminderStats::default();
    let mut notified: HashSet<String> = HashSet::new();

    for candidate in candidates {
        stats.tasks_checked += 1;

        let Some(window) = due_window(&candidate, now, tolerance) else {
            continue;
        };

        let body = formatting::reminder_message(
            &candidate.task.title,
            candidate.task.due_at,
            window,
            candidate.course_name.as_deref(),
        );

        if dispatcher.send_text(&candidate.chat_id, &body).await {
            // Persist before touching the next task; a crash here leaves the
            // marker set and the reminder will not repeat.
            store
                .set_reminder_sent(candidate.task.id, window, now)
                .await?;
            stats.sent += 1;
            *stats.by_window.entry(window.label()).or_insert(0) += 1;
            notified.insert(candidate.chat_id.clone());
        } else {
            // Marker stays clear; the task remains a candidate next run.
            warn!(
                task_id = candidate.task.id,
                window = window.label(),
                "Reminder dispatch failed"
            );
            stats.failed += 1;
        }
        // One attempt per task per run, even if more windows matched.
    }

    stats.users_notified = notified.len() as u64;
    info!(
        checked = stats.tasks_checked,
        sent = stats.sent,
        failed = stats.failed,
        users = stats.users_notified,
        "Reminder pass complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, seed_linked_user, setup_test_store, MockDispatcher};
    use crate::types::Tier;

    const TOLERANCE_SECS: i64 = 30 * 60;

    fn tolerance() -> Duration {
        Duration::seconds(TOLERANCE_SECS)
    }

    async fn make_premium(
        store: &crate::state::SqliteTaskStore,
        user_id: i64,
        now: DateTime<Utc>,
    ) {
        store
            .set_tier(user_id, Tier::Premium, Some(now + Duration::days(30)), now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn free_tier_concrete_scenario_dispatches_once_then_goes_quiet() {
        let (store, _db) = setup_test_store().await;
        let created = at(2025, 1, 1, 0, 0, 0);
        let user = seed_linked_user(&store, "42", created).await;

        let due = at(2025, 1, 10, 12, 0, 0);
        store
            .upsert_remote_task(user.id, None, "a-1", "Essay", due, created)
            .await
            .unwrap();

        // Within 30 minutes of the 24h mark.
        let first_run = at(2025, 1, 9, 12, 5, 0);
        let dispatcher = MockDispatcher::new();
        let stats = dispatch_due_reminders(&store, &dispatcher, first_run, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.users_notified, 1);
        assert_eq!(stats.by_window.get("24_hours"), Some(&1));

        let delivered = dispatcher.delivered().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "42");
        assert!(delivered[0].1.contains("Essay"));

        let task = store.list_active_tasks(user.id).await.unwrap().remove(0);
        assert!(task.sent.is_set(ReminderWindow::OneDay));

        // Five minutes later, still in the band: nothing new fires.
        let second_run = at(2025, 1, 9, 12, 10, 0);
        let dispatcher = MockDispatcher::new();
        let stats = dispatch_due_reminders(&store, &dispatcher, second_run, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.sent, 0);
        assert_eq!(dispatcher.attempt_count().await, 0);
    }

    #[tokio::test]
    async fn at_most_one_reminder_per_task_and_furthest_window_wins() {
        let (store, _db) = setup_test_store().await;
        let created = at(2025, 1, 1, 0, 0, 0);
        let user = seed_linked_user(&store, "42", created).await;
        make_premium(&store, user.id, created).await;

        // Due 90 minutes out: both the 2h and 1h targets sit exactly at the
        // tolerance edge, so both windows are simultaneously eligible.
        let now = at(2025, 1, 9, 12, 0, 0);
        let due = now + Duration::minutes(90);
        store
            .upsert_remote_task(user.id, None, "a-1", "Quiz", due, created)
            .await
            .unwrap();

        let dispatcher = MockDispatcher::new();
        let stats = dispatch_due_reminders(&store, &dispatcher, now, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.by_window.get("2_hours"), Some(&1));

        let task = store.list_active_tasks(user.id).await.unwrap().remove(0);
        assert!(task.sent.is_set(ReminderWindow::TwoHours));
        // The nearer window is untouched and fires on a later run.
        assert!(!task.sent.is_set(ReminderWindow::OneHour));

        let later = now + Duration::minutes(30);
        let dispatcher = MockDispatcher::new();
        let stats = dispatch_due_reminders(&store, &dispatcher, later, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.by_window.get("1_hour"), Some(&1));
    }

    #[tokio::test]
    async fn free_tier_never_gets_a_non_24h_window() {
        let (store, _db) = setup_test_store().await;
        let created = at(2025, 1, 1, 0, 0, 0);
        let user = seed_linked_user(&store, "42", created).await;

        // All six markers clear and the task squarely in the 8h band.
        let now = at(2025, 1, 9, 12, 0, 0);
        store
            .upsert_remote_task(user.id, None, "a-1", "Lab", now + Duration::hours(8), created)
            .await
            .unwrap();

        let dispatcher = MockDispatcher::new();
        let stats = dispatch_due_reminders(&store, &dispatcher, now, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.tasks_checked, 1);
        assert_eq!(stats.sent, 0);
        assert_eq!(dispatcher.attempt_count().await, 0);
    }

    #[tokio::test]
    async fn expired_premium_is_gated_like_free_until_swept() {
        let (store, _db) = setup_test_store().await;
        let created = at(2025, 1, 1, 0, 0, 0);
        let user = seed_linked_user(&store, "42", created).await;

        let now = at(2025, 1, 9, 12, 0, 0);
        // Stored tier is still premium but the expiry already passed.
        store
            .set_tier(user.id, Tier::Premium, Some(now - Duration::hours(1)), created)
            .await
            .unwrap();
        store
            .upsert_remote_task(user.id, None, "a-1", "Lab", now + Duration::hours(2), created)
            .await
            .unwrap();

        let dispatcher = MockDispatcher::new();
        let stats = dispatch_due_reminders(&store, &dispatcher, now, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_the_marker_clear_for_the_next_run() {
        let (store, _db) = setup_test_store().await;
        let created = at(2025, 1, 1, 0, 0, 0);
        let user = seed_linked_user(&store, "42", created).await;

        let now = at(2025, 1, 9, 12, 0, 0);
        store
            .upsert_remote_task(user.id, None, "a-1", "Essay", now + Duration::hours(24), created)
            .await
            .unwrap();

        let dispatcher = MockDispatcher::with_script(vec![false]);
        let stats = dispatch_due_reminders(&store, &dispatcher, now, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.failed, 1);

        let task = store.list_active_tasks(user.id).await.unwrap().remove(0);
        assert!(!task.sent.is_set(ReminderWindow::OneDay));

        // Delivery recovers; the same window fires on the retry run.
        let dispatcher = MockDispatcher::new();
        let stats =
            dispatch_due_reminders(&store, &dispatcher, now + Duration::minutes(10), tolerance())
                .await
                .unwrap();
        assert_eq!(stats.sent, 1);
        let task = store.list_active_tasks(user.id).await.unwrap().remove(0);
        assert!(task.sent.is_set(ReminderWindow::OneDay));
    }

    #[tokio::test]
    async fn one_tasks_failure_does_not_block_the_next_task() {
        let (store, _db) = setup_test_store().await;
        let created = at(2025, 1, 1, 0, 0, 0);
        let user = seed_linked_user(&store, "42", created).await;

        let now = at(2025, 1, 9, 12, 0, 0);
        store
            .upsert_remote_task(user.id, None, "a-1", "First", now + Duration::hours(24), created)
            .await
            .unwrap();
        store
            .upsert_remote_task(
                user.id,
                None,
                "a-2",
                "Second",
                now + Duration::hours(24) + Duration::minutes(5),
                created,
            )
            .await
            .unwrap();

        let dispatcher = MockDispatcher::with_script(vec![false, true]);
        let stats = dispatch_due_reminders(&store, &dispatcher, now, tolerance())
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.sent, 1);

        let delivered = dispatcher.delivered().await;
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].1.contains("Second"));
    }

    #[tokio::test]
    async fn premium_gets_the_full_ladder_one_window_per_run() {
        let (store, _db) = setup_test_store().await;
        let created = at(2025, 1, 1, 0, 0, 0);
        let user = seed_linked_user(&store, "42", created).await;
        make_premium(&store, user.id, created).await;

        let due = at(2025, 1, 16, 12, 0, 0);
        store
            .upsert_remote_task(user.id, None, "a-1", "Project", due, created)
            .await
            .unwrap();

        // Walk the daemon through each window's moment in turn.
        let expected = [
            (due - Duration::hours(168), "1_week"),
            (due - Duration::hours(72), "3_days"),
            (due - Duration::hours(24), "24_hours"),
            (due - Duration::hours(8), "8_hours"),
            (due - Duration::hours(2), "2_hours"),
            (due - Duration::hours(1), "1_hour"),
        ];
        for (moment, label) in expected {
            let dispatcher = MockDispatcher::new();
            let stats = dispatch_due_reminders(&store, &dispatcher, moment, tolerance())
                .await
                .unwrap();
            assert_eq!(stats.sent, 1, "window {} did not fire", label);
            assert_eq!(stats.by_window.get(label), Some(&1));
        }

        let task = store.list_active_tasks(user.id).await.unwrap().remove(0);
        for window in ReminderWindow::ALL {
            assert!(task.sent.is_set(window));
        }
    }
}
