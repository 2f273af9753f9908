//! Detection worker: claims pending jobs and runs the detector over them.
//!
//! Jobs for different documents run concurrently, up to
//! `max_concurrent_jobs`. Within a job chunks are processed one at a time in
//! ascending sequence order. A detector failure on one chunk is recorded on
//! the job and the loop moves on; only storage failures, a panic, or
//! shutdown abort a job, and chunks detected before the abort stay detected.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use tether_core::{
    defaults, ChunkFailure, ConnectionDetector, DetectionFilter, DetectionJob, Error, JobProgress,
    RedetectPolicy, Repositories, Result, ServerEvent,
};

use crate::DEFAULT_POLL_INTERVAL_MS;

/// Configuration for the detection worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval when the queue is empty (milliseconds).
    pub poll_interval_ms: u64,
    /// Maximum number of jobs (documents) processed at once.
    pub max_concurrent_jobs: usize,
    pub enabled: bool,
    /// Upper bound on a single detector call.
    pub chunk_timeout: Duration,
    pub redetect_policy: RedetectPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::DETECTION_MAX_CONCURRENT,
            enabled: true,
            chunk_timeout: Duration::from_secs(defaults::DETECTION_CHUNK_TIMEOUT_SECS),
            redetect_policy: RedetectPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DETECTION_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `DETECTION_MAX_CONCURRENT` | `4` | Max documents processed at once |
    /// | `DETECTION_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `DETECTION_CHUNK_TIMEOUT_SECS` | `120` | Per-chunk detector timeout |
    /// | `DETECTION_REDETECT_POLICY` | `append` | `append` or `replace` |
    pub fn from_env() -> Self {
        let enabled = std::env::var("DETECTION_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("DETECTION_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::DETECTION_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("DETECTION_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let chunk_timeout_secs = std::env::var("DETECTION_CHUNK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::DETECTION_CHUNK_TIMEOUT_SECS);

        let redetect_policy = match std::env::var("DETECTION_REDETECT_POLICY") {
            Ok(v) => RedetectPolicy::parse(&v).unwrap_or_else(|| {
                warn!(value = %v, "Unknown DETECTION_REDETECT_POLICY, using append");
                RedetectPolicy::Append
            }),
            Err(_) => RedetectPolicy::default(),
        };

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
            chunk_timeout: Duration::from_secs(chunk_timeout_secs),
            redetect_policy,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_redetect_policy(mut self, policy: RedetectPolicy) -> Self {
        self.redetect_policy = policy;
        self
    }
}

/// Event emitted by the detection worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job was claimed and its chunk set resolved.
    JobStarted {
        job_id: Uuid,
        document_id: Uuid,
        total: i32,
    },
    /// One chunk was detected and marked.
    ChunkDetected {
        job_id: Uuid,
        document_id: Uuid,
        chunk_id: Uuid,
        connections: usize,
        progress: JobProgress,
    },
    /// The detector failed for one chunk; the job continues.
    ChunkFailed {
        job_id: Uuid,
        document_id: Uuid,
        chunk_id: Uuid,
        error: String,
        progress: JobProgress,
    },
    JobCompleted {
        job_id: Uuid,
        document_id: Uuid,
        progress: JobProgress,
        duration_ms: i64,
    },
    JobFailed {
        job_id: Uuid,
        document_id: Uuid,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

impl WorkerEvent {
    /// The client-facing event for this worker event, if any.
    pub fn to_server_event(&self) -> Option<ServerEvent> {
        match self {
            WorkerEvent::JobStarted {
                job_id,
                document_id,
                total,
            } => Some(ServerEvent::JobStarted {
                job_id: *job_id,
                document_id: *document_id,
                total: *total,
            }),
            WorkerEvent::ChunkDetected {
                job_id,
                document_id,
                progress,
                ..
            }
            | WorkerEvent::ChunkFailed {
                job_id,
                document_id,
                progress,
                ..
            } => Some(ServerEvent::JobProgress {
                job_id: *job_id,
                document_id: *document_id,
                progress: *progress,
            }),
            WorkerEvent::JobCompleted {
                job_id,
                document_id,
                progress,
                duration_ms,
            } => Some(ServerEvent::JobCompleted {
                job_id: *job_id,
                document_id: *document_id,
                progress: *progress,
                duration_ms: Some(*duration_ms),
            }),
            WorkerEvent::JobFailed {
                job_id,
                document_id,
                error,
            } => Some(ServerEvent::JobFailed {
                job_id: *job_id,
                document_id: *document_id,
                error: error.clone(),
            }),
            WorkerEvent::WorkerStarted | WorkerEvent::WorkerStopped => None,
        }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down.
    ///
    /// In-flight jobs are aborted and marked failed; their detected chunks
    /// stay detected, so a later `Full` request resumes where they stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Detection worker that processes jobs from the queue.
pub struct DetectionWorker {
    repos: Repositories,
    detector: Arc<dyn ConnectionDetector>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl DetectionWorker {
    pub fn new(
        repos: Repositories,
        detector: Arc<dyn ConnectionDetector>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            repos,
            detector,
            config,
            event_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Claim the next pending job and run it to a terminal state inline.
    ///
    /// Returns the final job snapshot, or `None` when nothing is pending.
    pub async fn run_next(&self) -> Result<Option<DetectionJob>> {
        let Some(job) = self.repos.jobs.claim_next().await? else {
            return Ok(None);
        };
        let job_id = self.runner().execute(job).await;
        self.repos.jobs.get(job_id).await
    }

    /// Worker loop.
    ///
    /// Keeps up to `max_concurrent_jobs` jobs in flight and tops the set up
    /// as soon as one finishes. When idle it waits for a queue notification,
    /// the poll interval, or shutdown.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Detection worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            detector = self.detector.name(),
            redetect_policy = self.config.redetect_policy.as_str(),
            "Detection worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let notify = self.repos.jobs.notifier();
        let mut tasks: JoinSet<Uuid> = JoinSet::new();
        let mut in_flight: HashMap<Uuid, DetectionJob> = HashMap::new();

        loop {
            // Register interest before claiming so a job queued in between
            // still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while tasks.len() < self.config.max_concurrent_jobs {
                match self.claim_job().await {
                    Some(job) => {
                        in_flight.insert(job.id, job.clone());
                        let runner = self.runner();
                        tasks.spawn(async move { runner.execute(job).await });
                    }
                    None => break,
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Detection worker received shutdown signal");
                    break;
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    match result {
                        Ok(job_id) => {
                            in_flight.remove(&job_id);
                        }
                        Err(e) => error!(error = ?e, "Detection task failed to join"),
                    }
                }
                _ = &mut notified => {
                    debug!("Detection worker woken by queue notification");
                }
                _ = sleep(poll_interval) => {}
            }
        }

        tasks.abort_all();
        while let Some(result) = tasks.join_next().await {
            if let Ok(job_id) = result {
                in_flight.remove(&job_id);
            }
        }
        let runner = self.runner();
        for job in in_flight.values() {
            runner
                .abort_job(job, "worker aborted: shut down mid-job")
                .await;
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Detection worker stopped");
    }

    async fn claim_job(&self) -> Option<DetectionJob> {
        match self.repos.jobs.claim_next().await {
            Ok(job) => job,
            Err(e) => {
                error!(error = ?e, "Failed to claim detection job");
                None
            }
        }
    }

    fn runner(&self) -> JobRunner {
        JobRunner {
            repos: self.repos.clone(),
            detector: self.detector.clone(),
            chunk_timeout: self.config.chunk_timeout,
            redetect_policy: self.config.redetect_policy,
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Outcome of one chunk: storage errors abort the job (outer `Err`),
/// detector failures are recorded (inner `Err`).
type ChunkOutcome = Result<std::result::Result<usize, String>>;

/// Everything a spawned task needs to execute one claimed job.
struct JobRunner {
    repos: Repositories,
    detector: Arc<dyn ConnectionDetector>,
    chunk_timeout: Duration,
    redetect_policy: RedetectPolicy,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobRunner {
    /// Execute a claimed job and return its id. Never panics or leaves the
    /// job non-terminal except when the task itself is aborted.
    async fn execute(self, job: DetectionJob) -> Uuid {
        let job_id = job.id;
        match AssertUnwindSafe(self.run_job(&job)).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!(%job_id, error = %e, "Detection job aborted");
                self.abort_job(&job, &format!("worker aborted: {}", e))
                    .await;
            }
            Err(_) => {
                error!(%job_id, "Detection job panicked");
                self.abort_job(&job, "worker aborted: job task panicked")
                    .await;
            }
        }
        job_id
    }

    async fn abort_job(&self, job: &DetectionJob, reason: &str) {
        match self.repos.jobs.fail(job.id, reason).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Aborted job was already terminal");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = ?e, "Failed to mark job as failed");
                return;
            }
        }
        let _ = self.event_tx.send(WorkerEvent::JobFailed {
            job_id: job.id,
            document_id: job.document_id,
            error: reason.to_string(),
        });
    }

    /// Chunks a job covers, in sequence order, plus explicitly targeted
    /// ids that no longer exist.
    async fn resolve_chunks(&self, job: &DetectionJob) -> Result<(Vec<Uuid>, Vec<Uuid>)> {
        match job.scope.explicit_chunk_ids() {
            None => {
                let chunks = self
                    .repos
                    .chunks
                    .list_by_document(job.document_id, DetectionFilter::Undetected)
                    .await?;
                Ok((chunks.into_iter().map(|c| c.id).collect(), Vec::new()))
            }
            Some(ids) => {
                let chunks = self.repos.chunks.get_many(&ids).await?;
                let found: Vec<Uuid> = chunks
                    .iter()
                    .filter(|c| c.document_id == job.document_id)
                    .map(|c| c.id)
                    .collect();
                let missing = ids.into_iter().filter(|id| !found.contains(id)).collect();
                Ok((found, missing))
            }
        }
    }

    async fn run_job(&self, job: &DetectionJob) -> Result<JobProgress> {
        let start = Instant::now();
        let job_id = job.id;
        let document_id = job.document_id;

        let (chunk_ids, missing) = self.resolve_chunks(job).await?;
        let total = (chunk_ids.len() + missing.len()) as i32;
        let mut progress = JobProgress {
            completed: 0,
            failed: 0,
            total,
        };
        if !self.repos.jobs.start(job_id, total).await? {
            self.abandon(job, &progress);
            return Ok(progress);
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            op = "run_job",
            %job_id,
            %document_id,
            scope = job.scope.kind_str(),
            chunk_count = total,
            "Processing detection job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            document_id,
            total,
        });

        for chunk_id in missing {
            if !self
                .record_failure(job, chunk_id, "chunk not found".to_string(), &mut progress)
                .await?
            {
                self.abandon(job, &progress);
                return Ok(progress);
            }
        }

        for chunk_id in chunk_ids {
            match self.detect_chunk(job_id, chunk_id).await? {
                Ok(connections) => {
                    if !self.repos.jobs.record_progress(job_id, None).await? {
                        self.abandon(job, &progress);
                        return Ok(progress);
                    }
                    progress.completed += 1;
                    trace!(%job_id, %chunk_id, connections, "Chunk detected");
                    let _ = self.event_tx.send(WorkerEvent::ChunkDetected {
                        job_id,
                        document_id,
                        chunk_id,
                        connections,
                        progress,
                    });
                }
                Err(error) => {
                    if !self
                        .record_failure(job, chunk_id, error, &mut progress)
                        .await?
                    {
                        self.abandon(job, &progress);
                        return Ok(progress);
                    }
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as i64;
        if total > 0 && progress.completed == 0 {
            let reason = format!("all {} chunks failed detection", total);
            if !self.repos.jobs.fail(job_id, &reason).await? {
                self.abandon(job, &progress);
                return Ok(progress);
            }
            warn!(
                %job_id,
                %document_id,
                failure_count = progress.failed,
                duration_ms,
                "Detection job failed"
            );
            let _ = self.event_tx.send(WorkerEvent::JobFailed {
                job_id,
                document_id,
                error: reason,
            });
        } else {
            if !self.repos.jobs.complete(job_id).await? {
                self.abandon(job, &progress);
                return Ok(progress);
            }
            info!(
                %job_id,
                %document_id,
                chunk_count = progress.completed,
                failure_count = progress.failed,
                duration_ms,
                "Detection job completed"
            );
            let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                job_id,
                document_id,
                progress,
                duration_ms,
            });
        }
        Ok(progress)
    }

    /// The job left `Running` under us (reaped or failed externally). Its
    /// terminal state was already published by whoever moved it.
    fn abandon(&self, job: &DetectionJob, progress: &JobProgress) {
        warn!(
            job_id = %job.id,
            document_id = %job.document_id,
            completed = progress.completed,
            failed = progress.failed,
            total = progress.total,
            "Detection job is no longer running, stopping"
        );
    }

    /// Detect one chunk, store its connections and mark it detected.
    ///
    /// No store lock is held while the detector runs.
    async fn detect_chunk(&self, job_id: Uuid, chunk_id: Uuid) -> ChunkOutcome {
        let content = match self.repos.chunks.fetch_content(chunk_id).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => return Ok(Err(e.to_string())),
            Err(e) => return Err(e),
        };

        let detected =
            match tokio::time::timeout(self.chunk_timeout, self.detector.detect(&content)).await {
                Ok(Ok(connections)) => connections,
                Ok(Err(e)) => return Ok(Err(e.to_string())),
                Err(_) => {
                    return Ok(Err(format!(
                        "detector timed out after {}s",
                        self.chunk_timeout.as_secs_f32()
                    )))
                }
            };

        let inserted = self
            .repos
            .connections
            .record(chunk_id, job_id, detected, self.redetect_policy)
            .await?;
        self.repos.chunks.mark_detected(chunk_id, Utc::now()).await?;
        Ok(Ok(inserted))
    }

    async fn record_failure(
        &self,
        job: &DetectionJob,
        chunk_id: Uuid,
        error: String,
        progress: &mut JobProgress,
    ) -> Result<bool> {
        warn!(
            job_id = %job.id,
            %chunk_id,
            error = %error,
            "Chunk detection failed, continuing"
        );
        let recorded = self
            .repos
            .jobs
            .record_progress(
                job.id,
                Some(ChunkFailure {
                    chunk_id,
                    error: error.clone(),
                }),
            )
            .await?;
        if !recorded {
            return Ok(false);
        }
        progress.failed += 1;
        let _ = self.event_tx.send(WorkerEvent::ChunkFailed {
            job_id: job.id,
            document_id: job.document_id,
            chunk_id,
            error,
            progress: *progress,
        });
        Ok(true)
    }
}

/// Builder for creating a detection worker.
pub struct WorkerBuilder {
    repos: Repositories,
    config: WorkerConfig,
    detector: Option<Arc<dyn ConnectionDetector>>,
}

impl WorkerBuilder {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            config: WorkerConfig::default(),
            detector: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_detector<D: ConnectionDetector + 'static>(mut self, detector: D) -> Self {
        self.detector = Some(Arc::new(detector));
        self
    }

    pub fn with_shared_detector(mut self, detector: Arc<dyn ConnectionDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Build the worker. Fails with `Config` when no detector was set.
    pub fn build(self) -> Result<DetectionWorker> {
        let detector = self
            .detector
            .ok_or_else(|| Error::Config("detection worker needs a detector".to_string()))?;
        Ok(DetectionWorker::new(self.repos, detector, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(config.enabled);
        assert_eq!(config.chunk_timeout, Duration::from_secs(120));
        assert_eq!(config.redetect_policy, RedetectPolicy::Append);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(1000)
            .with_max_concurrent(8)
            .with_enabled(false)
            .with_chunk_timeout(Duration::from_secs(3))
            .with_redetect_policy(RedetectPolicy::Replace);

        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent_jobs, 8);
        assert!(!config.enabled);
        assert_eq!(config.chunk_timeout, Duration::from_secs(3));
        assert_eq!(config.redetect_policy, RedetectPolicy::Replace);
    }

    #[test]
    fn test_max_concurrent_never_zero() {
        let config = WorkerConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent_jobs, 1);
    }

    #[test]
    fn test_chunk_events_map_to_progress() {
        let progress = JobProgress {
            completed: 1,
            failed: 1,
            total: 3,
        };
        let event = WorkerEvent::ChunkFailed {
            job_id: Uuid::nil(),
            document_id: Uuid::nil(),
            chunk_id: Uuid::new_v4(),
            error: "boom".to_string(),
            progress,
        };
        match event.to_server_event() {
            Some(ServerEvent::JobProgress { progress: p, .. }) => assert_eq!(p, progress),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(WorkerEvent::WorkerStarted.to_server_event().is_none());
    }

    #[test]
    fn test_job_completed_maps_duration() {
        let event = WorkerEvent::JobCompleted {
            job_id: Uuid::nil(),
            document_id: Uuid::nil(),
            progress: JobProgress::default(),
            duration_ms: 42,
        };
        assert!(matches!(
            event.to_server_event(),
            Some(ServerEvent::JobCompleted {
                duration_ms: Some(42),
                ..
            })
        ));
    }
}
