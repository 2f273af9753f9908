//! Job orchestrator: the entry point for every detection request.
//!
//! Requests are validated here and turned into at most one pending job per
//! document. The atomic "no other active job" check lives in
//! [`DetectionJobRepository::create_exclusive`]; this layer only translates
//! its `None` into [`Error::AlreadyInProgress`].
//!
//! [`DetectionJobRepository::create_exclusive`]: tether_core::DetectionJobRepository::create_exclusive

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use tether_core::{
    ChunkContent, ChunkSummary, Connection, CorpusStats, CreatedBy, DetectionFilter,
    DetectionJob, DetectionState, DocumentStats, Error, EventBus, JobScope, Repositories,
    RequestOutcome, Result, ServerEvent,
};

/// Schedules detection jobs and answers status, stats and listing queries.
#[derive(Clone)]
pub struct DetectionService {
    repos: Repositories,
    events: Arc<EventBus>,
}

impl DetectionService {
    pub fn new(repos: Repositories, events: Arc<EventBus>) -> Self {
        Self { repos, events }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    async fn ensure_document(&self, document_id: Uuid) -> Result<()> {
        if self.repos.documents.exists(document_id).await? {
            Ok(())
        } else {
            Err(Error::DocumentNotFound(document_id))
        }
    }

    /// Check that every explicitly targeted chunk exists and belongs to
    /// `document_id`.
    async fn validate_scope(&self, document_id: Uuid, scope: &JobScope) -> Result<()> {
        let Some(ids) = scope.explicit_chunk_ids() else {
            return Ok(());
        };
        if ids.is_empty() {
            return Err(Error::InvalidInput(
                "selective scope needs at least one chunk".to_string(),
            ));
        }

        let found = self.repos.chunks.get_many(&ids).await?;
        for id in &ids {
            match found.iter().find(|c| c.id == *id) {
                None => return Err(Error::ChunkNotFound(*id)),
                Some(chunk) if chunk.document_id != document_id => {
                    return Err(Error::InvalidInput(format!(
                        "chunk {} belongs to document {}, not {}",
                        id, chunk.document_id, document_id
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Schedule detection for one document.
    ///
    /// Fails with `DocumentNotFound`, `ChunkNotFound`, `InvalidInput`, or
    /// `AlreadyInProgress` when the document has a pending or running job,
    /// whatever that job's scope.
    pub async fn request_detection(
        &self,
        document_id: Uuid,
        scope: JobScope,
        created_by: CreatedBy,
    ) -> Result<Uuid> {
        self.ensure_document(document_id).await?;
        self.validate_scope(document_id, &scope).await?;

        let scope_kind = scope.kind_str();
        match self
            .repos
            .jobs
            .create_exclusive(document_id, scope, created_by)
            .await?
        {
            Some(job_id) => {
                info!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    op = "request_detection",
                    %job_id,
                    %document_id,
                    scope = scope_kind,
                    created_by = created_by.as_str(),
                    "Detection job queued"
                );
                self.events.emit(ServerEvent::JobQueued {
                    job_id,
                    document_id,
                    scope: scope_kind.to_string(),
                    created_by,
                });
                Ok(job_id)
            }
            None => {
                let active = self.repos.jobs.active_for_document(document_id).await?;
                debug!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    %document_id,
                    active_job_id = ?active.as_ref().map(|j| j.id),
                    "Detection request rejected, job already active"
                );
                Err(Error::AlreadyInProgress {
                    document_id,
                    job_id: active.map(|j| j.id),
                })
            }
        }
    }

    /// Ingestion completion hook.
    ///
    /// With `enabled` this is `request_detection(document_id, Full, Auto)`;
    /// otherwise nothing is scheduled and the document's chunks stay
    /// undetected until someone asks.
    pub async fn request_detection_for_document(
        &self,
        document_id: Uuid,
        enabled: bool,
    ) -> Result<Option<Uuid>> {
        if !enabled {
            self.ensure_document(document_id).await?;
            debug!(
                subsystem = "jobs",
                component = "orchestrator",
                %document_id,
                "Automatic detection disabled for document"
            );
            return Ok(None);
        }
        self.request_detection(document_id, JobScope::Full, CreatedBy::Auto)
            .await
            .map(Some)
    }

    /// Queue one `Full` job per document that still has undetected chunks.
    ///
    /// Documents with an active job, or nothing left to detect, are reported
    /// as skipped instead of failing the whole request.
    pub async fn request_detection_for_corpus(
        &self,
        created_by: CreatedBy,
    ) -> Result<Vec<(Uuid, RequestOutcome)>> {
        let mut outcomes = Vec::new();
        for document_id in self.repos.documents.list_ids().await? {
            let pending = self
                .repos
                .chunks
                .list_by_document(document_id, DetectionFilter::Undetected)
                .await?;
            if pending.is_empty() {
                outcomes.push((
                    document_id,
                    RequestOutcome::Skipped {
                        reason: "no undetected chunks".to_string(),
                        active_job_id: None,
                    },
                ));
                continue;
            }

            let outcome = match self
                .request_detection(document_id, JobScope::Full, created_by)
                .await
            {
                Ok(job_id) => RequestOutcome::Queued { job_id },
                Err(Error::AlreadyInProgress { job_id, .. }) => RequestOutcome::Skipped {
                    reason: "detection already in progress".to_string(),
                    active_job_id: job_id,
                },
                Err(e) => return Err(e),
            };
            outcomes.push((document_id, outcome));
        }

        let queued = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RequestOutcome::Queued { .. }))
            .count();
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "request_detection_for_corpus",
            documents = outcomes.len(),
            queued,
            "Corpus detection requested"
        );
        Ok(outcomes)
    }

    /// Snapshot of a job.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<DetectionJob> {
        self.repos
            .jobs
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Every job of a document, newest first.
    pub async fn list_jobs(&self, document_id: Uuid) -> Result<Vec<DetectionJob>> {
        self.ensure_document(document_id).await?;
        self.repos.jobs.list_for_document(document_id).await
    }

    /// Detection counts for one document, read from current chunk state.
    pub async fn compute_stats(&self, document_id: Uuid) -> Result<DocumentStats> {
        self.ensure_document(document_id).await?;
        let summaries = self
            .repos
            .chunks
            .list_summaries(document_id, DetectionFilter::All)
            .await?;
        let active = self.repos.jobs.active_for_document(document_id).await?;
        Ok(DocumentStats::from_summaries(
            document_id,
            &summaries,
            active.map(|j| j.id),
        ))
    }

    pub async fn compute_corpus_stats(&self) -> Result<CorpusStats> {
        let mut documents = Vec::new();
        for document_id in self.repos.documents.list_ids().await? {
            documents.push(self.compute_stats(document_id).await?);
        }
        Ok(CorpusStats::from_documents(&documents))
    }

    /// Lightweight chunk projections in reading order.
    pub async fn list_chunks(
        &self,
        document_id: Uuid,
        filter: DetectionFilter,
    ) -> Result<Vec<ChunkSummary>> {
        self.ensure_document(document_id).await?;
        self.repos.chunks.list_summaries(document_id, filter).await
    }

    /// Full chunk text.
    pub async fn get_chunk_content(&self, chunk_id: Uuid) -> Result<ChunkContent> {
        self.repos.chunks.fetch_content(chunk_id).await
    }

    /// Stored connections whose source is the chunk.
    pub async fn list_connections(&self, chunk_id: Uuid) -> Result<Vec<Connection>> {
        if self.repos.chunks.get(chunk_id).await?.is_none() {
            return Err(Error::ChunkNotFound(chunk_id));
        }
        self.repos.connections.list_for_chunk(chunk_id).await
    }

    /// Schedule a new job over the chunks `job_id` failed on that are still
    /// undetected.
    pub async fn retry_failed(&self, job_id: Uuid) -> Result<Uuid> {
        let job = self.get_job_status(job_id).await?;
        if !job.is_terminal() {
            return Err(Error::AlreadyInProgress {
                document_id: job.document_id,
                job_id: Some(job.id),
            });
        }

        let failed = job.failed_chunk_ids();
        let still_undetected: BTreeSet<Uuid> = self
            .repos
            .chunks
            .get_many(&failed)
            .await?
            .into_iter()
            .filter(|c| c.detection.state() == DetectionState::Undetected)
            .map(|c| c.id)
            .collect();

        if still_undetected.is_empty() {
            return Err(Error::InvalidInput(format!(
                "job {} has no failed chunks left to retry",
                job_id
            )));
        }

        let scope = JobScope::Selective {
            chunk_ids: still_undetected,
        };
        self.request_detection(job.document_id, scope, CreatedBy::User)
            .await
    }
}
