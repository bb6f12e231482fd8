use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub reminders: RemindersConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "duebot.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CanvasConfig {
    /// Base address suggested to new users; each stored credential carries
    /// its own.
    #[serde(default = "default_canvas_base_url")]
    pub default_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            default_base_url: default_canvas_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_canvas_base_url() -> String {
    "https://canvas.instructure.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    /// Pause between users within one sync cycle. Deliberate backpressure
    /// against the upstream rate limit.
    #[serde(default = "default_inter_user_delay_ms")]
    pub inter_user_delay_ms: u64,
    /// A user is due for sync when their last sync is older than this.
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            inter_user_delay_ms: default_inter_user_delay_ms(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
        }
    }
}

fn default_sync_interval_secs() -> u64 {
    4 * 60 * 60
}
fn default_inter_user_delay_ms() -> u64 {
    2000
}
fn default_staleness_threshold_secs() -> u64 {
    6 * 60 * 60
}
fn default_rate_limit_backoff_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemindersConfig {
    #[serde(default = "default_reminder_interval_secs")]
    pub interval_secs: u64,
    /// Slack around each window's exact offset within which "now" matches.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
}

impl Default for RemindersConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reminder_interval_secs(),
            tolerance_secs: default_tolerance_secs(),
        }
    }
}

fn default_reminder_interval_secs() -> u64 {
    60 * 60
}
fn default_tolerance_secs() -> u64 {
    30 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_premium_duration_days")]
    pub premium_duration_days: i64,
    #[serde(default = "default_free_manual_task_limit")]
    pub free_manual_task_limit: i64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            premium_duration_days: default_premium_duration_days(),
            free_manual_task_limit: default_free_manual_task_limit(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    24 * 60 * 60
}
fn default_premium_duration_days() -> i64 {
    30
}
fn default_free_manual_task_limit() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    /// IP address to bind the health server to (default: "127.0.0.1").
    /// Set to "0.0.0.0" to listen on all interfaces.
    #[serde(default = "default_health_bind")]
    pub health_bind: String,
    /// Heartbeat tick granularity; jobs fire on their own intervals.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
            health_bind: default_health_bind(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

fn default_health_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_tick_interval_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. A failure here aborts the process before any
    /// store mutation happens.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token is required");
        }
        if self.reminders.tolerance_secs == 0 {
            anyhow::bail!("reminders.tolerance_secs must be positive");
        }
        if self.subscription.premium_duration_days <= 0 {
            anyhow::bail!("subscription.premium_duration_days must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [telegram]
            bot_token = "123:abc"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.state.db_path, "duebot.db");
        assert_eq!(config.sync.inter_user_delay_ms, 2000);
        assert_eq!(config.reminders.tolerance_secs, 1800);
        assert_eq!(config.subscription.premium_duration_days, 30);
    }

    #[test]
    fn empty_bot_token_is_a_startup_error() {
        let config: AppConfig = toml::from_str(
            r#"
            [telegram]
            bot_token = ""
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
