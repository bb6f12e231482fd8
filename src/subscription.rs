//! Subscription lifecycle: derived state, window entitlement, activation,
//! and the free-tier manual-task quota.
//!
//! Everything here is a pure function over immutable snapshots except
//! `activate_premium`, which performs the single store write for a validated
//! activation event.

use chrono::{DateTime, Datelike, Duration, Utc};

use crate::traits::store_prelude::*;
use crate::traits::{TaskStore, User};
use crate::types::{ReminderWindow, Tier};

/// Effective subscription state. Always derived from the stored tier plus
/// the clock; the tier column alone is never trusted as "active".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Free,
    PremiumActive,
    PremiumExpired,
}

impl SubscriptionState {
    pub fn derive(
        tier: Tier,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SubscriptionState {
        match tier {
            Tier::Free => SubscriptionState::Free,
            Tier::Premium => match expires_at {
                Some(expiry) if now < expiry => SubscriptionState::PremiumActive,
                // A premium row without an expiry should not exist; treat it
                // as expired rather than granting entitlements.
                _ => SubscriptionState::PremiumExpired,
            },
        }
    }

    pub fn of_user(user: &User, now: DateTime<Utc>) -> SubscriptionState {
        SubscriptionState::derive(user.tier, user.premium_expires_at, now)
    }
}

const FREE_WINDOWS: [ReminderWindow; 1] = [ReminderWindow::OneDay];

/// The window set a user's tasks may trigger. Only an actively premium user
/// gets the full ladder; an expired-but-unswept premium user falls back to
/// the free set.
pub fn entitled_windows(state: SubscriptionState) -> &'static [ReminderWindow] {
    match state {
        SubscriptionState::PremiumActive => &ReminderWindow::ALL,
        SubscriptionState::Free | SubscriptionState::PremiumExpired => &FREE_WINDOWS,
    }
}

/// Handle a validated activation event: flip the user to premium with a full
/// period starting at `now`. Re-activation restarts the whole duration; no
/// partial-period carryover.
pub async fn activate_premium(
    store: &dyn TaskStore,
    user_id: i64,
    now: DateTime<Utc>,
    duration_days: i64,
) -> anyhow::Result<DateTime<Utc>> {
    let expires_at = now + Duration::days(duration_days);
    store
        .set_tier(user_id, Tier::Premium, Some(expires_at), now)
        .await?;
    Ok(expires_at)
}

/// Whether the calendar month has rolled over since the counter was last
/// reset.
pub fn month_rolled_over(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now.year(), now.month()) != (reset_at.year(), reset_at.month())
}

/// Free users get a fixed number of manual tasks per calendar month; an
/// actively premium user is unlimited. The stored counter is ignored once
/// the month has rolled over (the next increment resets it).
pub fn can_add_manual_task(user: &User, now: DateTime<Utc>, free_limit: i64) -> bool {
    if SubscriptionState::of_user(user, now) == SubscriptionState::PremiumActive {
        return true;
    }
    if month_rolled_over(user.month_reset_at, now) {
        return true;
    }
    user.manual_tasks_this_month < free_limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn user(tier: Tier, expires_at: Option<DateTime<Utc>>) -> User {
        let created = at(2025, 1, 1, 0, 0, 0);
        User {
            id: 1,
            chat_id: "42".into(),
            canvas_token: None,
            canvas_user_id: None,
            canvas_base_url: None,
            token_invalid: false,
            tier,
            premium_expires_at: expires_at,
            reminders_enabled: true,
            weekly_digest_enabled: true,
            is_active: true,
            manual_tasks_this_month: 0,
            month_reset_at: created,
            last_sync_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn premium_is_active_strictly_before_expiry() {
        let expiry = at(2025, 2, 1, 0, 0, 0);
        let premium = |now| SubscriptionState::derive(Tier::Premium, Some(expiry), now);

        assert_eq!(
            premium(expiry - Duration::seconds(1)),
            SubscriptionState::PremiumActive
        );
        assert_eq!(premium(expiry), SubscriptionState::PremiumExpired);
        assert_eq!(
            premium(expiry + Duration::seconds(1)),
            SubscriptionState::PremiumExpired
        );
    }

    #[test]
    fn premium_without_expiry_grants_nothing() {
        let state = SubscriptionState::derive(Tier::Premium, None, at(2025, 1, 1, 0, 0, 0));
        assert_eq!(state, SubscriptionState::PremiumExpired);
        assert_eq!(entitled_windows(state), &[ReminderWindow::OneDay]);
    }

    #[test]
    fn free_tier_is_entitled_to_exactly_the_24_hour_window() {
        assert_eq!(
            entitled_windows(SubscriptionState::Free),
            &[ReminderWindow::OneDay]
        );
        assert_eq!(
            entitled_windows(SubscriptionState::PremiumActive).len(),
            6
        );
    }

    #[test]
    fn month_rollover_compares_calendar_months_not_31_day_spans() {
        let reset = at(2025, 1, 31, 23, 0, 0);
        assert!(!month_rolled_over(reset, at(2025, 1, 31, 23, 59, 0)));
        assert!(month_rolled_over(reset, at(2025, 2, 1, 0, 1, 0)));
        assert!(month_rolled_over(reset, at(2026, 1, 31, 23, 0, 0)));
    }

    #[test]
    fn manual_task_quota_gates_free_users_only() {
        let now = at(2025, 1, 15, 12, 0, 0);

        let mut free = user(Tier::Free, None);
        free.manual_tasks_this_month = 4;
        assert!(can_add_manual_task(&free, now, 5));
        free.manual_tasks_this_month = 5;
        assert!(!can_add_manual_task(&free, now, 5));

        // Quota clears once the month rolls over.
        assert!(can_add_manual_task(&free, at(2025, 2, 1, 0, 0, 0), 5));

        let mut premium = user(Tier::Premium, Some(now + Duration::days(10)));
        premium.manual_tasks_this_month = 99;
        assert!(can_add_manual_task(&premium, now, 5));

        // Expired premium is quota-gated like free.
        let mut lapsed = user(Tier::Premium, Some(now - Duration::days(1)));
        lapsed.manual_tasks_this_month = 5;
        assert!(!can_add_manual_task(&lapsed, now, 5));
    }
}
