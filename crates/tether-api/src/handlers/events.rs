//! Job event stream and the worker → event bus bridge.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::{wrappers::BroadcastStream, StreamExt as _};
use uuid::Uuid;

use tether_core::{defaults, EventBus, EventEnvelope};
use tether_jobs::WorkerEvent;

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventStreamQuery {
    /// Only deliver events about this document.
    pub document_id: Option<Uuid>,
}

/// `GET /api/v1/events`
///
/// Server-Sent Events carrying [`EventEnvelope`]s, named by their
/// namespaced type (`job.progress`, ...). Events missed by a lagging client
/// are skipped; job status stays pollable.
pub async fn sse_events(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.service.event_bus().subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result: Result<EventEnvelope, _>| {
        let envelope = result.ok()?;
        if let Some(document_id) = query.document_id {
            if envelope.payload.document_id() != document_id {
                return None;
            }
        }
        let event_type = envelope.event_type.clone();
        Event::default()
            .event(event_type)
            .json_data(&envelope)
            .ok()
            .map(Ok)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(defaults::SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    )
}

/// Forward worker events onto the shared event bus until the worker's
/// channel closes.
pub async fn bridge_worker_events(
    mut worker_rx: broadcast::Receiver<WorkerEvent>,
    event_bus: Arc<EventBus>,
) {
    loop {
        match worker_rx.recv().await {
            Ok(event) => {
                if let Some(server_event) = event.to_server_event() {
                    event_bus.emit(server_event);
                }
            }
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(
                    subsystem = "api",
                    component = "event_bridge",
                    missed = n,
                    "Event bridge lagged, missed events"
                );
            }
            Err(RecvError::Closed) => {
                tracing::info!(
                    subsystem = "api",
                    component = "event_bridge",
                    "Worker event channel closed, bridge stopping"
                );
                break;
            }
        }
    }
}
