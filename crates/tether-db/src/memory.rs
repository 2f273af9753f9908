//! In-process store implementing every repository trait.
//!
//! Backs `STORAGE=memory` and the orchestrator/worker test suites. One
//! `RwLock` guards all tables, so each trait method is atomic with respect
//! to every other, which is what `create_exclusive` and `claim_next` need.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use tether_core::{
    new_v7, Chunk, ChunkContent, ChunkFailure, ChunkRepository, ChunkSummary, Connection,
    ConnectionRepository, CreatedBy, DetectedConnection, Detection, DetectionFilter,
    DetectionJob, DetectionJobRepository, DetectionState, Document, DocumentRepository, Error,
    JobProgress, JobScope, JobStatus, NewChunk, RedetectPolicy, Repositories, Result,
};

use crate::connections::dedupe_run;

struct StoredChunk {
    chunk: Chunk,
    content: String,
}

#[derive(Default)]
struct State {
    /// Insertion order is creation order.
    documents: Vec<Document>,
    chunks: HashMap<Uuid, StoredChunk>,
    connections: Vec<Connection>,
    /// Insertion order is creation order.
    jobs: Vec<DetectionJob>,
}

impl State {
    fn job_mut(&mut self, id: Uuid) -> Result<&mut DetectionJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(Error::JobNotFound(id))
    }

    fn chunks_of(&self, document_id: Uuid, filter: DetectionFilter) -> Vec<&StoredChunk> {
        let mut chunks: Vec<&StoredChunk> = self
            .chunks
            .values()
            .filter(|c| {
                c.chunk.document_id == document_id && filter.matches(c.chunk.detection.state())
            })
            .collect();
        chunks.sort_by_key(|c| c.chunk.sequence_number);
        chunks
    }

    fn connection_count(&self, chunk_id: Uuid) -> i64 {
        self.connections
            .iter()
            .filter(|c| c.source_chunk_id == chunk_id)
            .count() as i64
    }
}

/// Shared in-memory storage. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    notify: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository bundle over this store.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            documents: Arc::new(self.clone()),
            chunks: Arc::new(self.clone()),
            connections: Arc::new(self.clone()),
            jobs: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl DocumentRepository for MemoryStore {
    async fn insert(&self, title: &str) -> Result<Uuid> {
        let id = new_v7();
        self.state.write().await.documents.push(Document {
            id,
            title: title.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        let state = self.state.read().await;
        Ok(state.documents.iter().find(|d| d.id == id).cloned())
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.documents.iter().any(|d| d.id == id))
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state.documents.iter().map(|d| d.id).collect())
    }
}

#[async_trait]
impl ChunkRepository for MemoryStore {
    async fn insert_batch(&self, document_id: Uuid, chunks: Vec<NewChunk>) -> Result<Vec<Uuid>> {
        let mut state = self.state.write().await;
        if !state.documents.iter().any(|d| d.id == document_id) {
            return Err(Error::DocumentNotFound(document_id));
        }

        let mut taken: HashSet<i32> = state
            .chunks
            .values()
            .filter(|c| c.chunk.document_id == document_id)
            .map(|c| c.chunk.sequence_number)
            .collect();
        for chunk in &chunks {
            if !taken.insert(chunk.sequence_number) {
                return Err(Error::InvalidInput(format!(
                    "duplicate sequence number {}",
                    chunk.sequence_number
                )));
            }
        }

        let mut ids = Vec::with_capacity(chunks.len());
        for new in chunks {
            let id = new_v7();
            state.chunks.insert(
                id,
                StoredChunk {
                    chunk: Chunk {
                        id,
                        document_id,
                        sequence_number: new.sequence_number,
                        detection: Detection::Undetected,
                    },
                    content: new.content,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Chunk>> {
        let state = self.state.read().await;
        Ok(state.chunks.get(&id).map(|c| c.chunk.clone()))
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Chunk>> {
        let state = self.state.read().await;
        let mut chunks: Vec<Chunk> = ids
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|id| state.chunks.get(id).map(|c| c.chunk.clone()))
            .collect();
        chunks.sort_by_key(|c| (c.document_id, c.sequence_number));
        Ok(chunks)
    }

    async fn get_state(&self, id: Uuid) -> Result<DetectionState> {
        let state = self.state.read().await;
        state
            .chunks
            .get(&id)
            .map(|c| c.chunk.detection.state())
            .ok_or(Error::ChunkNotFound(id))
    }

    async fn mark_detected(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state.chunks.get_mut(&id).ok_or(Error::ChunkNotFound(id))?;
        stored.chunk.detection = Detection::Detected { detected_at: at };
        Ok(())
    }

    async fn mark_undetected(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state.chunks.get_mut(&id).ok_or(Error::ChunkNotFound(id))?;
        stored.chunk.detection = Detection::Undetected;
        Ok(())
    }

    async fn list_by_document(
        &self,
        document_id: Uuid,
        filter: DetectionFilter,
    ) -> Result<Vec<Chunk>> {
        let state = self.state.read().await;
        Ok(state
            .chunks_of(document_id, filter)
            .into_iter()
            .map(|c| c.chunk.clone())
            .collect())
    }

    async fn list_summaries(
        &self,
        document_id: Uuid,
        filter: DetectionFilter,
    ) -> Result<Vec<ChunkSummary>> {
        let state = self.state.read().await;
        Ok(state
            .chunks_of(document_id, filter)
            .into_iter()
            .map(|c| ChunkSummary {
                id: c.chunk.id,
                sequence_number: c.chunk.sequence_number,
                detection_state: c.chunk.detection.state(),
                detected_at: c.chunk.detection.detected_at(),
                connection_count: state.connection_count(c.chunk.id),
                preview: ChunkSummary::preview_of(&c.content),
            })
            .collect())
    }

    async fn fetch_content(&self, id: Uuid) -> Result<ChunkContent> {
        let state = self.state.read().await;
        let stored = state.chunks.get(&id).ok_or(Error::ChunkNotFound(id))?;
        Ok(ChunkContent {
            id: stored.chunk.id,
            document_id: stored.chunk.document_id,
            sequence_number: stored.chunk.sequence_number,
            content: stored.content.clone(),
        })
    }
}

#[async_trait]
impl ConnectionRepository for MemoryStore {
    async fn record(
        &self,
        source_chunk_id: Uuid,
        job_id: Uuid,
        connections: Vec<DetectedConnection>,
        policy: RedetectPolicy,
    ) -> Result<usize> {
        let mut state = self.state.write().await;
        if !state.chunks.contains_key(&source_chunk_id) {
            return Err(Error::ChunkNotFound(source_chunk_id));
        }

        if policy == RedetectPolicy::Replace {
            state
                .connections
                .retain(|c| c.source_chunk_id != source_chunk_id || c.job_id == job_id);
        }

        let now = Utc::now();
        let mut inserted = 0;
        for conn in dedupe_run(connections) {
            let duplicate = state.connections.iter().any(|c| {
                c.source_chunk_id == source_chunk_id
                    && c.job_id == job_id
                    && c.target == conn.target
                    && c.kind == conn.kind
            });
            if duplicate {
                continue;
            }
            state.connections.push(Connection {
                id: new_v7(),
                source_chunk_id,
                job_id,
                target: conn.target,
                kind: conn.kind,
                strength: conn.strength,
                metadata: conn.metadata,
                created_at: now,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn list_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<Connection>> {
        let state = self.state.read().await;
        Ok(state
            .connections
            .iter()
            .filter(|c| c.source_chunk_id == chunk_id)
            .cloned()
            .collect())
    }

    async fn count_for_chunk(&self, chunk_id: Uuid) -> Result<i64> {
        Ok(self.state.read().await.connection_count(chunk_id))
    }
}

#[async_trait]
impl DetectionJobRepository for MemoryStore {
    async fn create_exclusive(
        &self,
        document_id: Uuid,
        scope: JobScope,
        created_by: CreatedBy,
    ) -> Result<Option<Uuid>> {
        let mut state = self.state.write().await;
        if !state.documents.iter().any(|d| d.id == document_id) {
            return Err(Error::DocumentNotFound(document_id));
        }
        if state
            .jobs
            .iter()
            .any(|j| j.document_id == document_id && !j.is_terminal())
        {
            return Ok(None);
        }

        let now = Utc::now();
        let id = new_v7();
        state.jobs.push(DetectionJob {
            id,
            document_id,
            scope,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            failures: Vec::new(),
            error_message: None,
            created_by,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        });
        drop(state);

        self.notify.notify_waiters();
        Ok(Some(id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<DetectionJob>> {
        let state = self.state.read().await;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn active_for_document(&self, document_id: Uuid) -> Result<Option<DetectionJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .iter()
            .find(|j| j.document_id == document_id && !j.is_terminal())
            .cloned())
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<DetectionJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .iter()
            .rev()
            .filter(|j| j.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn claim_next(&self) -> Result<Option<DetectionJob>> {
        let mut state = self.state.write().await;
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.status == JobStatus::Pending)
        else {
            return Ok(None);
        };
        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn start(&self, id: Uuid, total: i32) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.progress.total = total;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_progress(&self, id: Uuid, failure: Option<ChunkFailure>) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        match failure {
            None => job.progress.completed += 1,
            Some(failure) => {
                job.progress.failed += 1;
                job.failures.push(failure);
            }
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn fail_stale(&self, not_updated_since: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut reaped = Vec::new();
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < not_updated_since)
        {
            job.error_message = Some(format!("no progress since {}", job.updated_at));
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            job.updated_at = now;
            reaped.push(job.id);
        }
        Ok(reaped)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
