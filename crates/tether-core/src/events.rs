//! Server event types, envelope schema, and event bus for live progress.
//!
//! Detection requests and the worker publish into a single broadcast
//! channel; downstream consumers (SSE streams, logs) subscribe
//! independently. Polling `get_job_status` stays the authoritative way to
//! read progress, the bus only makes it prompt.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{CreatedBy, JobProgress};

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned envelope around a [`ServerEvent`].
///
/// `event_type` uses dot-namespaced names (`"job.progress"`). Consumers
/// should ignore unknown fields.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type.
    pub event_type: String,
    /// When the event occurred (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Type of entity this event relates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// ID of the entity this event relates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: ServerEvent,
}

impl EventEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            entity_type: event.entity_type().map(String::from),
            entity_id: event.entity_id().map(|id| id.to_string()),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Server Event (domain payloads)
// ============================================================================

/// Detection lifecycle events, serialized with a `type` tag:
/// `{"type":"JobProgress","job_id":"...","completed":3,...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A detection job was created.
    JobQueued {
        job_id: Uuid,
        document_id: Uuid,
        scope: String,
        created_by: CreatedBy,
    },
    /// A worker claimed the job and resolved its chunk set.
    JobStarted {
        job_id: Uuid,
        document_id: Uuid,
        total: i32,
    },
    /// One more chunk was processed.
    JobProgress {
        job_id: Uuid,
        document_id: Uuid,
        #[serde(flatten)]
        progress: JobProgress,
    },
    /// The job finished; `progress.failed` chunks stay undetected.
    JobCompleted {
        job_id: Uuid,
        document_id: Uuid,
        #[serde(flatten)]
        progress: JobProgress,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },
    /// The job failed as a whole.
    JobFailed {
        job_id: Uuid,
        document_id: Uuid,
        error: String,
    },
}

impl ServerEvent {
    /// Short event name (SSE `event:` field).
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::JobQueued { .. } => "JobQueued",
            ServerEvent::JobStarted { .. } => "JobStarted",
            ServerEvent::JobProgress { .. } => "JobProgress",
            ServerEvent::JobCompleted { .. } => "JobCompleted",
            ServerEvent::JobFailed { .. } => "JobFailed",
        }
    }

    /// Namespaced event type for the envelope.
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            ServerEvent::JobQueued { .. } => "job.queued",
            ServerEvent::JobStarted { .. } => "job.started",
            ServerEvent::JobProgress { .. } => "job.progress",
            ServerEvent::JobCompleted { .. } => "job.completed",
            ServerEvent::JobFailed { .. } => "job.failed",
        }
    }

    pub fn entity_type(&self) -> Option<&'static str> {
        Some("job")
    }

    pub fn entity_id(&self) -> Option<Uuid> {
        match self {
            ServerEvent::JobQueued { job_id, .. }
            | ServerEvent::JobStarted { job_id, .. }
            | ServerEvent::JobProgress { job_id, .. }
            | ServerEvent::JobCompleted { job_id, .. }
            | ServerEvent::JobFailed { job_id, .. } => Some(*job_id),
        }
    }

    /// Document the event concerns.
    pub fn document_id(&self) -> Uuid {
        match self {
            ServerEvent::JobQueued { document_id, .. }
            | ServerEvent::JobStarted { document_id, .. }
            | ServerEvent::JobProgress { document_id, .. }
            | ServerEvent::JobCompleted { document_id, .. }
            | ServerEvent::JobFailed { document_id, .. } => *document_id,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus.
///
/// Slow receivers that fall behind get a `Lagged` error and miss events;
/// job status stays pollable, so nothing is lost for good.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently without subscribers.
    pub fn emit(&self, event: ServerEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();

        bus.emit(ServerEvent::JobStarted {
            job_id,
            document_id: Uuid::nil(),
            total: 5,
        });

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(
            envelope.payload,
            ServerEvent::JobStarted { total: 5, .. }
        ));
        assert_eq!(envelope.event_type, "job.started");
        assert_eq!(envelope.entity_type.as_deref(), Some("job"));
        assert_eq!(envelope.entity_id, Some(job_id.to_string()));
        assert_eq!(envelope.payload_version, 1);
    }

    #[tokio::test]
    async fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new(32);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(ServerEvent::JobFailed {
            job_id: Uuid::nil(),
            document_id: Uuid::nil(),
            error: "worker aborted".to_string(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap().payload,
            ServerEvent::JobFailed { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap().payload,
            ServerEvent::JobFailed { .. }
        ));
    }

    #[test]
    fn test_event_bus_no_subscribers_ok() {
        let bus = EventBus::new(32);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(ServerEvent::JobStarted {
            job_id: Uuid::nil(),
            document_id: Uuid::nil(),
            total: 0,
        });
    }

    #[test]
    fn test_progress_event_flattens_counts() {
        let event = ServerEvent::JobProgress {
            job_id: Uuid::nil(),
            document_id: Uuid::nil(),
            progress: JobProgress {
                completed: 2,
                failed: 1,
                total: 4,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobProgress");
        assert_eq!(json["completed"], 2);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["total"], 4);
    }
}
