//! Subscription expiry sweep: detect lapsed premium subscriptions, revert
//! them to the free tier, and tell the user once, best-effort.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::channels::formatting;
use crate::traits::store_prelude::*;
use crate::traits::{Dispatcher, TaskStore};
use crate::types::Tier;

#[derive(Debug, Default)]
pub struct ExpiryStats {
    pub downgraded: u64,
    pub notified: u64,
    pub failed: u64,
}

/// Downgrade every user whose stored tier is premium and whose expiry has
/// passed. The tier flip is authoritative; the notification that follows is
/// best-effort and never rolls it back.
pub async fn run_expiry_sweep(
    store: &dyn TaskStore,
    dispatcher: &dyn Dispatcher,
    now: DateTime<Utc>,
) -> anyhow::Result<ExpiryStats> {
    let expired = store.list_users_with_expired_premium(now).await?;

    let mut stats = ExpiryStats::default();
    if expired.is_empty() {
        info!("No expired premium subscriptions");
        return Ok(stats);
    }
    info!(count = expired.len(), "Processing expired premium users");

    for user in expired {
        if let Err(e) = store.set_tier(user.id, Tier::Free, None, now).await {
            error!(user_id = user.id, "Failed to downgrade user: {}", e);
            stats.failed += 1;
            continue;
        }
        stats.downgraded += 1;

        if dispatcher
            .send_text(&user.chat_id, &formatting::downgrade_notice())
            .await
        {
            stats.notified += 1;
        } else {
            warn!(user_id = user.id, "Downgrade notice was not delivered");
        }
    }

    info!(
        downgraded = stats.downgraded,
        notified = stats.notified,
        "Expiry sweep complete"
    );
    Ok(stats)
}
