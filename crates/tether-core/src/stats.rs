//! Document and corpus detection statistics.
//!
//! Stats are derived on demand from chunk summaries; nothing is cached.
//! Counts read while a job is running reflect whatever has been persisted
//! so far, which is what the UI shows as "in progress".

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChunkSummary, DetectionState};

/// Detection statistics for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub document_id: Uuid,
    pub total: i64,
    pub detected: i64,
    pub undetected: i64,
    pub total_connections: i64,
    /// `total_connections / total`, 0.0 for an empty document.
    pub avg_connections_per_chunk: f64,
    /// The document's pending or running job, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_job_id: Option<Uuid>,
}

impl DocumentStats {
    pub fn from_summaries(
        document_id: Uuid,
        summaries: &[ChunkSummary],
        active_job_id: Option<Uuid>,
    ) -> Self {
        let total = summaries.len() as i64;
        let detected = summaries
            .iter()
            .filter(|s| s.detection_state == DetectionState::Detected)
            .count() as i64;
        let total_connections: i64 = summaries.iter().map(|s| s.connection_count).sum();

        Self {
            document_id,
            total,
            detected,
            undetected: total - detected,
            total_connections,
            avg_connections_per_chunk: average(total_connections, total),
            active_job_id,
        }
    }

    /// Every chunk detected (vacuously true for an empty document).
    pub fn is_fully_detected(&self) -> bool {
        self.undetected == 0
    }
}

/// Detection statistics summed over every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub documents: i64,
    pub fully_detected_documents: i64,
    pub documents_in_progress: i64,
    pub total: i64,
    pub detected: i64,
    pub undetected: i64,
    pub total_connections: i64,
    pub avg_connections_per_chunk: f64,
}

impl CorpusStats {
    pub fn from_documents<'a>(documents: impl IntoIterator<Item = &'a DocumentStats>) -> Self {
        let mut stats = CorpusStats::default();
        for doc in documents {
            stats.documents += 1;
            if doc.is_fully_detected() {
                stats.fully_detected_documents += 1;
            }
            if doc.active_job_id.is_some() {
                stats.documents_in_progress += 1;
            }
            stats.total += doc.total;
            stats.detected += doc.detected;
            stats.undetected += doc.undetected;
            stats.total_connections += doc.total_connections;
        }
        stats.avg_connections_per_chunk = average(stats.total_connections, stats.total);
        stats
    }
}

fn average(sum: i64, count: i64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn summary(seq: i32, detected: bool, connections: i64) -> ChunkSummary {
        ChunkSummary {
            id: Uuid::new_v4(),
            sequence_number: seq,
            detection_state: if detected {
                DetectionState::Detected
            } else {
                DetectionState::Undetected
            },
            detected_at: detected.then(Utc::now),
            connection_count: connections,
            preview: String::new(),
        }
    }

    #[test]
    fn test_document_stats_counts() {
        let doc = Uuid::new_v4();
        let summaries = vec![summary(0, true, 3), summary(1, false, 0), summary(2, true, 1)];
        let stats = DocumentStats::from_summaries(doc, &summaries, None);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.detected, 2);
        assert_eq!(stats.undetected, 1);
        assert_eq!(stats.total_connections, 4);
        assert!((stats.avg_connections_per_chunk - 4.0 / 3.0).abs() < f64::EPSILON);
        assert!(!stats.is_fully_detected());
    }

    #[test]
    fn test_document_stats_empty() {
        let stats = DocumentStats::from_summaries(Uuid::new_v4(), &[], None);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.avg_connections_per_chunk, 0.0);
        assert!(stats.is_fully_detected());
    }

    #[test]
    fn test_corpus_stats_sums_documents() {
        let a = DocumentStats::from_summaries(
            Uuid::new_v4(),
            &[summary(0, true, 2), summary(1, true, 2)],
            None,
        );
        let b = DocumentStats::from_summaries(
            Uuid::new_v4(),
            &[summary(0, false, 0), summary(1, true, 4)],
            Some(Uuid::new_v4()),
        );
        let corpus = CorpusStats::from_documents([&a, &b]);
        assert_eq!(corpus.documents, 2);
        assert_eq!(corpus.fully_detected_documents, 1);
        assert_eq!(corpus.documents_in_progress, 1);
        assert_eq!(corpus.total, 4);
        assert_eq!(corpus.detected, 3);
        assert_eq!(corpus.undetected, 1);
        assert_eq!(corpus.total_connections, 8);
        assert_eq!(corpus.avg_connections_per_chunk, 2.0);
    }
}
