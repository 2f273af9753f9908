//! Shared reader/list focus over HTTP.
//!
//! Views write through `PUT /api/v1/cursor` and follow the other view
//! through the SSE stream. A stream opened with `?observer=reader` only
//! delivers cursors the reader should re-center on.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::{wrappers::WatchStream, StreamExt as _};
use uuid::Uuid;

use tether_core::{defaults, Error, Observer};

use crate::error::ApiError;
use crate::AppState;

/// `GET /api/v1/cursor`
pub async fn get_cursor(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cursor.current())
}

#[derive(Debug, Deserialize)]
pub struct SetCursorBody {
    pub chunk_id: Option<Uuid>,
    pub origin: Observer,
}

/// `PUT /api/v1/cursor`
///
/// Returns the cursor after the write. Re-sending the chunk the cursor
/// already points at leaves it untouched.
pub async fn set_cursor(
    State(state): State<AppState>,
    Json(body): Json<SetCursorBody>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(chunk_id) = body.chunk_id {
        if state
            .service
            .repositories()
            .chunks
            .get(chunk_id)
            .await?
            .is_none()
        {
            return Err(Error::ChunkNotFound(chunk_id).into());
        }
    }
    Ok(Json(state.cursor.set_cursor(body.chunk_id, body.origin)))
}

#[derive(Debug, Default, Deserialize)]
pub struct CursorStreamQuery {
    pub observer: Option<Observer>,
}

/// `GET /api/v1/cursor/stream`
///
/// Sends the current cursor on connect, then the latest value after each
/// accepted write. Intermediate values may be skipped.
pub async fn cursor_stream(
    State(state): State<AppState>,
    Query(query): Query<CursorStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let observer = query.observer.map(|who| state.cursor.observer(who));

    let stream = WatchStream::new(state.cursor.subscribe()).filter_map(move |cursor| {
        if let Some(observer) = &observer {
            if !observer.should_react(&cursor) {
                return None;
            }
        }
        Event::default()
            .event("cursor")
            .json_data(cursor)
            .ok()
            .map(Ok)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(defaults::SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    )
}
