use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::canvas::CanvasClient;
use crate::channels::{formatting, TelegramDispatcher};
use crate::config::AppConfig;
use crate::daemon;
use crate::heartbeat::{HeartbeatCoordinator, HeartbeatTelemetry};
use crate::jobs;
use crate::state::SqliteTaskStore;
use crate::subscription;
use crate::traits::store_prelude::*;
use crate::traits::{is_overdue, CanvasCredential, Dispatcher, NewUser, RemoteGateway};

struct Deps {
    store: Arc<SqliteTaskStore>,
    gateway: Arc<dyn RemoteGateway>,
    dispatcher: Arc<dyn Dispatcher>,
}

async fn build_deps(config: &AppConfig) -> anyhow::Result<Deps> {
    let store = Arc::new(SqliteTaskStore::new(&config.state.db_path).await?);
    info!("Task store initialized ({})", config.state.db_path);

    let gateway: Arc<dyn RemoteGateway> =
        Arc::new(CanvasClient::new(config.canvas.request_timeout_secs)?);
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(TelegramDispatcher::new(&config.telegram.bot_token));

    Ok(Deps {
        store,
        gateway,
        dispatcher,
    })
}

/// Run the daemon: all three jobs on their intervals plus the health server.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let deps = build_deps(&config).await?;

    let telemetry = Arc::new(HeartbeatTelemetry::new());
    let mut coordinator =
        HeartbeatCoordinator::new(config.daemon.tick_interval_secs, 2, telemetry.clone());

    // 1. Mirror reconciliation
    {
        let store = deps.store.clone();
        let gateway = deps.gateway.clone();
        let sync_config = config.sync.clone();
        coordinator.register_job(
            "sync",
            Duration::from_secs(config.sync.interval_secs),
            move || {
                let store = store.clone();
                let gateway = gateway.clone();
                let sync_config = sync_config.clone();
                async move {
                    jobs::sync::run_sync_cycle(&*store, &*gateway, &sync_config, Utc::now())
                        .await?;
                    Ok(())
                }
            },
        );
    }

    // 2. Reminder dispatch
    {
        let store = deps.store.clone();
        let dispatcher = deps.dispatcher.clone();
        let tolerance = chrono::Duration::seconds(config.reminders.tolerance_secs as i64);
        coordinator.register_job(
            "reminders",
            Duration::from_secs(config.reminders.interval_secs),
            move || {
                let store = store.clone();
                let dispatcher = dispatcher.clone();
                async move {
                    jobs::reminders::dispatch_due_reminders(
                        &*store,
                        &*dispatcher,
                        Utc::now(),
                        tolerance,
                    )
                    .await?;
                    Ok(())
                }
            },
        );
    }

    // 3. Subscription expiry sweep
    {
        let store = deps.store.clone();
        let dispatcher = deps.dispatcher.clone();
        coordinator.register_job(
            "sweep",
            Duration::from_secs(config.subscription.sweep_interval_secs),
            move || {
                let store = store.clone();
                let dispatcher = dispatcher.clone();
                async move {
                    jobs::expiry::run_expiry_sweep(&*store, &*dispatcher, Utc::now()).await?;
                    Ok(())
                }
            },
        );
    }

    // 4. Health server
    let health_bind = config.daemon.health_bind.clone();
    let health_port = config.daemon.health_port;
    let health_telemetry = telemetry.clone();
    tokio::spawn(async move {
        if let Err(e) = daemon::start_health_server(&health_bind, health_port, health_telemetry).await
        {
            tracing::error!("Health server error: {}", e);
        }
    });

    info!("Starting duebot v{}", env!("CARGO_PKG_VERSION"));
    coordinator.run().await;
    Ok(())
}

/// One sync cycle, then exit. Used by `duebot sync` and cron-style setups.
pub async fn run_sync_once(config: AppConfig) -> anyhow::Result<()> {
    let deps = build_deps(&config).await?;
    let stats =
        jobs::sync::run_sync_cycle(&*deps.store, &*deps.gateway, &config.sync, Utc::now()).await?;
    println!(
        "sync: {} users processed, {} failed, {} added, {} updated, {} removed",
        stats.users_processed,
        stats.users_failed,
        stats.totals.added,
        stats.totals.updated,
        stats.totals.removed
    );
    deps.store.close().await;
    Ok(())
}

/// One reminder pass, then exit.
pub async fn run_remind_once(config: AppConfig) -> anyhow::Result<()> {
    let deps = build_deps(&config).await?;
    let tolerance = chrono::Duration::seconds(config.reminders.tolerance_secs as i64);
    let stats = jobs::reminders::dispatch_due_reminders(
        &*deps.store,
        &*deps.dispatcher,
        Utc::now(),
        tolerance,
    )
    .await?;
    println!(
        "reminders: {} checked, {} sent, {} failed",
        stats.tasks_checked, stats.sent, stats.failed
    );
    deps.store.close().await;
    Ok(())
}

/// One expiry sweep, then exit.
pub async fn run_sweep_once(config: AppConfig) -> anyhow::Result<()> {
    let deps = build_deps(&config).await?;
    let stats =
        jobs::expiry::run_expiry_sweep(&*deps.store, &*deps.dispatcher, Utc::now()).await?;
    println!(
        "sweep: {} downgraded, {} notified",
        stats.downgraded, stats.notified
    );
    deps.store.close().await;
    Ok(())
}

/// Link (or relink) a Canvas account. The user row is created on the first
/// successful credential validation.
pub async fn run_link(
    config: AppConfig,
    chat_id: &str,
    token: &str,
    base_url: Option<&str>,
) -> anyhow::Result<()> {
    let deps = build_deps(&config).await?;
    let credential = CanvasCredential {
        base_url: base_url
            .unwrap_or(&config.canvas.default_base_url)
            .to_string(),
        token: token.to_string(),
    };

    let validation = deps.gateway.validate(&credential).await?;
    if !validation.valid {
        anyhow::bail!("credential rejected by {}", credential.base_url);
    }
    let remote_user_id = validation.remote_user_id.unwrap_or_default();

    let now = Utc::now();
    match deps.store.get_user_by_chat_id(chat_id).await? {
        Some(user) => {
            deps.store
                .update_credential(user.id, &credential, &remote_user_id, now)
                .await?;
            println!("relinked {}", chat_id);
        }
        None => {
            deps.store
                .create_user(
                    &NewUser {
                        chat_id: chat_id.to_string(),
                        canvas_token: Some(credential.token.clone()),
                        canvas_user_id: Some(remote_user_id),
                        canvas_base_url: Some(credential.base_url.clone()),
                    },
                    now,
                )
                .await?;
            println!(
                "linked {} as {}",
                chat_id,
                validation.display_name.as_deref().unwrap_or("(unnamed)")
            );
        }
    }
    deps.store.close().await;
    Ok(())
}

/// Grant a full premium period, as the payment layer does after a validated
/// activation event.
pub async fn run_activate(config: AppConfig, chat_id: &str) -> anyhow::Result<()> {
    let deps = build_deps(&config).await?;
    let user = deps
        .store
        .get_user_by_chat_id(chat_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no user with chat id {}", chat_id))?;

    let expires_at = subscription::activate_premium(
        &*deps.store,
        user.id,
        Utc::now(),
        config.subscription.premium_duration_days,
    )
    .await?;
    println!(
        "{} is premium until {}",
        chat_id,
        formatting::format_due(expires_at)
    );
    deps.store.close().await;
    Ok(())
}

/// Create a manual task for a user, honoring the free-tier monthly quota.
pub async fn run_add_task(
    config: AppConfig,
    chat_id: &str,
    title: &str,
    due_raw: &str,
) -> anyhow::Result<()> {
    let due_at = chrono::DateTime::parse_from_rfc3339(due_raw)
        .map_err(|e| anyhow::anyhow!("due date must be RFC 3339 (e.g. 2025-06-01T17:00:00Z): {}", e))?
        .with_timezone(&Utc);

    let deps = build_deps(&config).await?;
    let user = deps
        .store
        .get_user_by_chat_id(chat_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no user with chat id {}", chat_id))?;

    let now = Utc::now();
    if !subscription::can_add_manual_task(&user, now, config.subscription.free_manual_task_limit) {
        anyhow::bail!(
            "monthly manual-task limit ({}) reached for {}",
            config.subscription.free_manual_task_limit,
            chat_id
        );
    }

    let task = deps
        .store
        .create_manual_task(user.id, None, title, due_at, now)
        .await?;
    deps.store.increment_manual_tasks(user.id, now).await?;

    println!("task {} created, due {}", task.id, formatting::format_due(due_at));
    if is_overdue(&task, now) {
        println!("note: that deadline is already in the past");
    }
    deps.store.close().await;
    Ok(())
}
