//! Stale job reaper.
//!
//! A job whose worker stopped reporting progress would keep its document
//! locked in `Running` forever. The reaper periodically fails every running
//! job whose last heartbeat is older than `reap_after`. Queued jobs are left
//! alone however long they wait.
//! It is opt-in: without `DETECTION_REAP_AFTER_SECS` nothing is reaped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use tether_core::{defaults, DetectionJobRepository, Error, EventBus, Result, ServerEvent};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Heartbeat age after which a job is failed. `None` disables reaping.
    pub reap_after: Option<Duration>,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            reap_after: None,
            interval: Duration::from_secs(defaults::REAP_INTERVAL_SECS),
        }
    }
}

impl ReaperConfig {
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DETECTION_REAP_AFTER_SECS` | unset | Heartbeat age that marks a job stale |
    /// | `DETECTION_REAP_INTERVAL_SECS` | `60` | How often to look for stale jobs |
    pub fn from_env() -> Self {
        let reap_after = std::env::var("DETECTION_REAP_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let interval = std::env::var("DETECTION_REAP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::REAP_INTERVAL_SECS)
            .max(1);

        Self {
            reap_after,
            interval: Duration::from_secs(interval),
        }
    }

    pub fn with_reap_after(mut self, after: Duration) -> Self {
        self.reap_after = Some(after);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Handle for stopping a running reaper.
pub struct ReaperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ReaperHandle {
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }
}

pub struct JobReaper {
    jobs: Arc<dyn DetectionJobRepository>,
    events: Arc<EventBus>,
    config: ReaperConfig,
}

impl JobReaper {
    pub fn new(
        jobs: Arc<dyn DetectionJobRepository>,
        events: Arc<EventBus>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            jobs,
            events,
            config,
        }
    }

    /// Fail every stale job once. Returns the reaped job ids.
    pub async fn reap_once(&self) -> Result<Vec<Uuid>> {
        let Some(reap_after) = self.config.reap_after else {
            return Ok(Vec::new());
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(reap_after)
                .map_err(|e| Error::Config(format!("reap_after out of range: {}", e)))?;

        let reaped = self.jobs.fail_stale(cutoff).await?;
        for job_id in &reaped {
            let job = self.jobs.get(*job_id).await?;
            let (document_id, error) = match job {
                Some(job) => (
                    job.document_id,
                    job.error_message.unwrap_or_else(|| "reaped".to_string()),
                ),
                None => continue,
            };
            warn!(
                subsystem = "jobs",
                component = "reaper",
                %job_id,
                %document_id,
                reap_after_secs = reap_after.as_secs(),
                "Reaped stale detection job"
            );
            self.events.emit(ServerEvent::JobFailed {
                job_id: *job_id,
                document_id,
                error,
            });
        }
        Ok(reaped)
    }

    /// Spawn the periodic reap loop. Returns `None` when reaping is disabled.
    pub fn start(self) -> Option<ReaperHandle> {
        let reap_after = self.config.reap_after?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        info!(
            subsystem = "jobs",
            component = "reaper",
            reap_after_secs = reap_after.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Job reaper started"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(self.config.interval) => {
                        if let Err(e) = self.reap_once().await {
                            error!(error = ?e, "Job reaper pass failed");
                        }
                    }
                }
            }
            info!(subsystem = "jobs", component = "reaper", "Job reaper stopped");
        });

        Some(ReaperHandle { shutdown_tx })
    }
}
