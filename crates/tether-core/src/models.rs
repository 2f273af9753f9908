//! Domain models for documents, chunks, connections and detection jobs.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults::SNIPPET_LENGTH;
use crate::error::{Error, Result};

// =============================================================================
// DOCUMENTS
// =============================================================================

/// A document produced by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// CHUNK DETECTION STATE
// =============================================================================

/// Field-less detection state, used for filters and wire output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionState {
    Undetected,
    Detected,
}

impl DetectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionState::Undetected => "undetected",
            DetectionState::Detected => "detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "undetected" => Some(DetectionState::Undetected),
            "detected" => Some(DetectionState::Detected),
            _ => None,
        }
    }
}

/// Detection state of a chunk.
///
/// The timestamp lives inside the `Detected` variant, so a chunk can never
/// be detected without a `detected_at` or carry one while undetected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Detection {
    Undetected,
    Detected { detected_at: DateTime<Utc> },
}

impl Detection {
    pub fn state(&self) -> DetectionState {
        match self {
            Detection::Undetected => DetectionState::Undetected,
            Detection::Detected { .. } => DetectionState::Detected,
        }
    }

    pub fn detected_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Detection::Undetected => None,
            Detection::Detected { detected_at } => Some(*detected_at),
        }
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, Detection::Detected { .. })
    }

    /// Rebuild from the two persisted columns, rejecting rows that break the
    /// `detected_at` iff `Detected` invariant.
    pub fn from_parts(state: DetectionState, detected_at: Option<DateTime<Utc>>) -> Result<Self> {
        match (state, detected_at) {
            (DetectionState::Undetected, None) => Ok(Detection::Undetected),
            (DetectionState::Detected, Some(at)) => Ok(Detection::Detected { detected_at: at }),
            (state, at) => Err(Error::Internal(format!(
                "inconsistent chunk detection state: {} with detected_at={:?}",
                state.as_str(),
                at
            ))),
        }
    }
}

/// Filter for chunk listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionFilter {
    #[default]
    All,
    Detected,
    Undetected,
}

impl DetectionFilter {
    pub fn matches(&self, state: DetectionState) -> bool {
        match self {
            DetectionFilter::All => true,
            DetectionFilter::Detected => state == DetectionState::Detected,
            DetectionFilter::Undetected => state == DetectionState::Undetected,
        }
    }

    /// The single state this filter selects, or `None` for `All`.
    pub fn state(&self) -> Option<DetectionState> {
        match self {
            DetectionFilter::All => None,
            DetectionFilter::Detected => Some(DetectionState::Detected),
            DetectionFilter::Undetected => Some(DetectionState::Undetected),
        }
    }
}

// =============================================================================
// CHUNKS
// =============================================================================

/// Chunk metadata. Content is fetched separately through [`ChunkContent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Reading order within the document; unique per document.
    pub sequence_number: i32,
    pub detection: Detection,
}

/// Full chunk text, the heavy half of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContent {
    pub id: Uuid,
    pub document_id: Uuid,
    pub sequence_number: i32,
    pub content: String,
}

/// Lightweight list projection of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub id: Uuid,
    pub sequence_number: i32,
    pub detection_state: DetectionState,
    pub detected_at: Option<DateTime<Utc>>,
    pub connection_count: i64,
    pub preview: String,
}

impl ChunkSummary {
    /// Leading `SNIPPET_LENGTH` characters of the content.
    pub fn preview_of(content: &str) -> String {
        content.chars().take(SNIPPET_LENGTH).collect()
    }
}

/// A chunk handed over by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChunk {
    pub sequence_number: i32,
    pub content: String,
}

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Kind of connection reported by a detector.
///
/// Opaque to detection control flow; kept for display and deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnectionKind {
    SemanticSimilarity,
    Contradiction,
    ThematicBridge,
    Other(String),
}

impl ConnectionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionKind::SemanticSimilarity => "semantic_similarity",
            ConnectionKind::Contradiction => "contradiction",
            ConnectionKind::ThematicBridge => "thematic_bridge",
            ConnectionKind::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for ConnectionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "semantic_similarity" => ConnectionKind::SemanticSimilarity,
            "contradiction" => ConnectionKind::Contradiction,
            "thematic_bridge" => ConnectionKind::ThematicBridge,
            _ => ConnectionKind::Other(s),
        }
    }
}

impl From<ConnectionKind> for String {
    fn from(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a connection points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "ref", rename_all = "snake_case")]
pub enum ConnectionTarget {
    /// Another chunk, possibly in a different document.
    Chunk(Uuid),
    /// An entity outside the corpus (URL, concept id, ...).
    External(String),
}

/// A connection as returned by a detector, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedConnection {
    pub target: ConnectionTarget,
    pub kind: ConnectionKind,
    pub strength: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// A stored connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub source_chunk_id: Uuid,
    /// The detection run that produced this row.
    pub job_id: Uuid,
    pub target: ConnectionTarget,
    pub kind: ConnectionKind,
    pub strength: f32,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

/// What happens to a chunk's existing connections when it is detected again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedetectPolicy {
    /// Keep rows from earlier runs and add the new run's rows.
    #[default]
    Append,
    /// Drop rows from earlier runs before storing the new run's rows.
    Replace,
}

impl RedetectPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedetectPolicy::Append => "append",
            RedetectPolicy::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Some(RedetectPolicy::Append),
            "replace" => Some(RedetectPolicy::Replace),
            _ => None,
        }
    }
}

// =============================================================================
// DETECTION JOBS
// =============================================================================

/// Which chunks of a document a job covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobScope {
    /// Every chunk of the document still undetected when the job starts.
    Full,
    /// Exactly these chunks, regardless of their current state.
    Selective { chunk_ids: BTreeSet<Uuid> },
    /// Exactly this chunk, regardless of its current state.
    Single { chunk_id: Uuid },
}

impl JobScope {
    pub fn kind_str(&self) -> &'static str {
        match self {
            JobScope::Full => "full",
            JobScope::Selective { .. } => "selective",
            JobScope::Single { .. } => "single",
        }
    }

    /// Explicitly targeted chunk ids, or `None` for `Full`.
    pub fn explicit_chunk_ids(&self) -> Option<Vec<Uuid>> {
        match self {
            JobScope::Full => None,
            JobScope::Selective { chunk_ids } => Some(chunk_ids.iter().copied().collect()),
            JobScope::Single { chunk_id } => Some(vec![*chunk_id]),
        }
    }
}

/// Status of a detection job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Who asked for a job. Observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    Auto,
    User,
}

impl CreatedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreatedBy::Auto => "auto",
            CreatedBy::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(CreatedBy::Auto),
            "user" => Some(CreatedBy::User),
            _ => None,
        }
    }
}

/// Progress of a job. `completed` counts chunks detected successfully,
/// `failed` counts chunks whose detector call failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub completed: i32,
    pub failed: i32,
    pub total: i32,
}

impl JobProgress {
    pub fn processed(&self) -> i32 {
        self.completed + self.failed
    }

    /// Processed share in whole percent; an empty job counts as done.
    pub fn percent(&self) -> i32 {
        if self.total <= 0 {
            return 100;
        }
        ((self.processed() as i64 * 100) / self.total as i64) as i32
    }
}

/// A chunk whose detector call failed during a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: Uuid,
    pub error: String,
}

/// One unit of orchestrated detection work for a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub scope: JobScope,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub failures: Vec<ChunkFailure>,
    /// Job-level failure reason (abort, every chunk failed, reaped).
    pub error_message: Option<String>,
    pub created_by: CreatedBy,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last heartbeat: creation, claim, or progress update.
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DetectionJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn failed_chunk_ids(&self) -> Vec<Uuid> {
        self.failures.iter().map(|f| f.chunk_id).collect()
    }
}

/// Per-document result of a corpus-wide detection request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    Queued {
        job_id: Uuid,
    },
    Skipped {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        active_job_id: Option<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detection_from_parts_consistent() {
        let now = Utc::now();
        assert_eq!(
            Detection::from_parts(DetectionState::Undetected, None).unwrap(),
            Detection::Undetected
        );
        let detected = Detection::from_parts(DetectionState::Detected, Some(now)).unwrap();
        assert_eq!(detected.detected_at(), Some(now));
        assert_eq!(detected.state(), DetectionState::Detected);
    }

    #[test]
    fn test_detection_from_parts_rejects_mismatch() {
        assert!(Detection::from_parts(DetectionState::Detected, None).is_err());
        assert!(Detection::from_parts(DetectionState::Undetected, Some(Utc::now())).is_err());
    }

    #[test]
    fn test_detection_serializes_with_state_tag() {
        let value = serde_json::to_value(Detection::Undetected).unwrap();
        assert_eq!(value, json!({"state": "undetected"}));
    }

    #[test]
    fn test_detection_filter_matches() {
        assert!(DetectionFilter::All.matches(DetectionState::Detected));
        assert!(DetectionFilter::All.matches(DetectionState::Undetected));
        assert!(DetectionFilter::Detected.matches(DetectionState::Detected));
        assert!(!DetectionFilter::Detected.matches(DetectionState::Undetected));
        assert!(DetectionFilter::Undetected.matches(DetectionState::Undetected));
        assert_eq!(DetectionFilter::All.state(), None);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let content = "é".repeat(SNIPPET_LENGTH + 10);
        let preview = ChunkSummary::preview_of(&content);
        assert_eq!(preview.chars().count(), SNIPPET_LENGTH);
        assert_eq!(ChunkSummary::preview_of("short"), "short");
    }

    #[test]
    fn test_connection_kind_string_forms() {
        let kind: ConnectionKind = "thematic_bridge".to_string().into();
        assert_eq!(kind, ConnectionKind::ThematicBridge);
        let custom: ConnectionKind = "citation".to_string().into();
        assert_eq!(custom, ConnectionKind::Other("citation".to_string()));
        assert_eq!(
            serde_json::to_value(&ConnectionKind::SemanticSimilarity).unwrap(),
            json!("semantic_similarity")
        );
        assert_eq!(serde_json::to_value(&custom).unwrap(), json!("citation"));
    }

    #[test]
    fn test_detected_connection_deserialize() {
        let target = Uuid::new_v4();
        let conn: DetectedConnection = serde_json::from_value(json!({
            "target": {"type": "chunk", "ref": target},
            "kind": "contradiction",
            "strength": 0.8
        }))
        .unwrap();
        assert_eq!(conn.target, ConnectionTarget::Chunk(target));
        assert_eq!(conn.kind, ConnectionKind::Contradiction);
        assert!(conn.metadata.is_none());
    }

    #[test]
    fn test_job_scope_serde_shapes() {
        assert_eq!(
            serde_json::to_value(&JobScope::Full).unwrap(),
            json!({"kind": "full"})
        );
        let id = Uuid::new_v4();
        let scope: JobScope =
            serde_json::from_value(json!({"kind": "single", "chunk_id": id})).unwrap();
        assert_eq!(scope, JobScope::Single { chunk_id: id });
        assert_eq!(scope.explicit_chunk_ids(), Some(vec![id]));
        assert_eq!(JobScope::Full.explicit_chunk_ids(), None);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_job_progress_percent() {
        let progress = JobProgress {
            completed: 2,
            failed: 1,
            total: 4,
        };
        assert_eq!(progress.processed(), 3);
        assert_eq!(progress.percent(), 75);
        assert_eq!(JobProgress::default().percent(), 100);
    }

    #[test]
    fn test_redetect_policy_parse() {
        assert_eq!(RedetectPolicy::parse("Replace"), Some(RedetectPolicy::Replace));
        assert_eq!(RedetectPolicy::parse(" append "), Some(RedetectPolicy::Append));
        assert_eq!(RedetectPolicy::parse("merge"), None);
        assert_eq!(RedetectPolicy::default(), RedetectPolicy::Append);
    }
}
