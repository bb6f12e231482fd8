//! Periodic job coordinator.
//!
//! A single tick loop fires the registered jobs on their own intervals. Each
//! job body runs in a spawned task gated by a semaphore; an `is_running`
//! guard skips a job whose previous invocation is still going, and repeated
//! failures back the job off exponentially. Correctness never depends on
//! this layer firing exactly once — the jobs themselves are idempotent over
//! the store.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Runtime snapshot of one periodic job, served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatJobSnapshot {
    pub name: String,
    pub interval_secs: u64,
    pub last_run_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub is_running: bool,
}

impl HeartbeatJobSnapshot {
    fn new(name: &str, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            interval_secs: interval.as_secs(),
            last_run_at: None,
            last_success_at: None,
            last_error_at: None,
            last_error: None,
            consecutive_failures: 0,
            is_running: false,
        }
    }
}

/// Shared telemetry for the health endpoint.
#[derive(Default)]
pub struct HeartbeatTelemetry {
    jobs: Mutex<HashMap<String, HeartbeatJobSnapshot>>,
}

impl HeartbeatTelemetry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn register_job(&self, name: &str, interval: Duration) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.entry(name.to_string())
            .or_insert_with(|| HeartbeatJobSnapshot::new(name, interval));
    }

    fn mark_started(&self, name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_run_at = Some(Utc::now().to_rfc3339());
            job.is_running = true;
        }
    }

    fn mark_success(&self, name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_success_at = Some(Utc::now().to_rfc3339());
            job.last_error = None;
            job.last_error_at = None;
            job.consecutive_failures = 0;
            job.is_running = false;
        }
    }

    fn mark_failure(&self, name: &str, consecutive_failures: u32, message: String) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_error_at = Some(Utc::now().to_rfc3339());
            job.last_error = Some(message);
            job.consecutive_failures = consecutive_failures;
            job.is_running = false;
        }
    }

    pub fn snapshots(&self) -> Vec<HeartbeatJobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<HeartbeatJobSnapshot> = jobs.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

/// Type alias for the async closure that heartbeat jobs execute.
type HeartbeatRunFn =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// A registered periodic job.
struct HeartbeatJob {
    name: String,
    interval: Duration,
    last_run: Option<Instant>,
    /// Guards against overlapping invocations of the same job.
    is_running: Arc<AtomicBool>,
    /// Consecutive failure count — drives exponential backoff.
    consecutive_failures: Arc<AtomicU32>,
    run: HeartbeatRunFn,
}

/// Coordinates the periodic jobs in a single tick loop. Each tick takes
/// microseconds; actual work runs in spawned tasks gated by the semaphore.
pub struct HeartbeatCoordinator {
    jobs: Vec<HeartbeatJob>,
    semaphore: Arc<Semaphore>,
    tick_interval: Duration,
    telemetry: Arc<HeartbeatTelemetry>,
}

impl HeartbeatCoordinator {
    pub fn new(
        tick_interval_secs: u64,
        max_concurrent: usize,
        telemetry: Arc<HeartbeatTelemetry>,
    ) -> Self {
        Self {
            jobs: Vec::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            tick_interval: Duration::from_secs(tick_interval_secs),
            telemetry,
        }
    }

    /// Register a periodic job.
    pub fn register_job<F, Fut>(&mut self, name: &str, interval: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.jobs.push(HeartbeatJob {
            name: name.to_string(),
            interval,
            last_run: None,
            is_running: Arc::new(AtomicBool::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            run: Box::new(move || Box::pin(f())),
        });
        self.telemetry.register_job(name, interval);
    }

    /// Run the tick loop forever.
    pub async fn run(mut self) {
        info!(
            jobs = self.jobs.len(),
            tick_secs = self.tick_interval.as_secs(),
            "Heartbeat coordinator started"
        );
        loop {
            self.tick();
            tokio::time::sleep(self.tick_interval).await;
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        for job in &mut self.jobs {
            let should_run = match job.last_run {
                None => true,
                Some(last) => now.duration_since(last) >= job.interval,
            };
            if !should_run {
                continue;
            }

            // Skip if the previous invocation is still running.
            if job.is_running.load(Ordering::Relaxed) {
                tracing::debug!(job = %job.name, "Skipping — previous invocation still running");
                continue;
            }

            // Exponential backoff for a failing job:
            // effective_interval = interval * 2^min(failures, 5)
            let failures = job.consecutive_failures.load(Ordering::Relaxed);
            if failures > 0 {
                let effective_interval = job.interval * 2u32.pow(failures.min(5));
                let elapsed = match job.last_run {
                    Some(last) => now.duration_since(last),
                    None => effective_interval,
                };
                if elapsed < effective_interval {
                    tracing::debug!(
                        job = %job.name,
                        failures,
                        backoff_secs = effective_interval.as_secs(),
                        "Skipping — backoff not elapsed"
                    );
                    continue;
                }
            }

            job.last_run = Some(now);
            let sem = self.semaphore.clone();
            let fut = (job.run)();
            let job_name = job.name.clone();
            let is_running = job.is_running.clone();
            let consecutive_failures = job.consecutive_failures.clone();
            let telemetry = self.telemetry.clone();
            is_running.store(true, Ordering::Relaxed);
            telemetry.mark_started(&job_name);

            tokio::spawn(async move {
                let _permit = sem.acquire().await;
                tracing::debug!(job = %job_name, "Heartbeat job starting");
                // Catch panics as failures for backoff purposes.
                let result = AssertUnwindSafe(fut).catch_unwind().await;
                is_running.store(false, Ordering::Relaxed);
                match result {
                    Ok(Ok(())) => {
                        let prev = consecutive_failures.swap(0, Ordering::Relaxed);
                        if prev > 0 {
                            info!(job = %job_name, prev_failures = prev, "Heartbeat job recovered");
                        }
                        telemetry.mark_success(&job_name);
                    }
                    Ok(Err(e)) => {
                        let count = consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        error!(
                            job = %job_name,
                            error = %e,
                            consecutive_failures = count,
                            "Heartbeat job failed — backing off"
                        );
                        telemetry.mark_failure(&job_name, count, e.to_string());
                    }
                    Err(_) => {
                        let count = consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        error!(
                            job = %job_name,
                            consecutive_failures = count,
                            "Heartbeat job panicked — backing off"
                        );
                        telemetry.mark_failure(&job_name, count, "job panicked".to_string());
                    }
                }
            });
        }
    }
}
