//! Shared focus cursor for the linear reader and the chunk list.
//!
//! Both views show "the chunk currently in focus". Each writes the cursor
//! when its own user interaction moves focus, tagging the write with its
//! identity, and re-centers itself only for cursors written by the other
//! view. A write that would not move the cursor to a different chunk is
//! dropped, so a view re-centering on a requested chunk never writes back.
//!
//! The value is swapped whole through a `tokio::sync::watch` channel:
//! last write wins and subscribers only ever see the latest cursor.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::trace;
use uuid::Uuid;

/// A view that drives or follows navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observer {
    /// The long top-to-bottom reading view.
    Reader,
    /// The random-access chunk list.
    ListView,
}

impl Observer {
    pub fn other(&self) -> Observer {
        match self {
            Observer::Reader => Observer::ListView,
            Observer::ListView => Observer::Reader,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Observer::Reader => "reader",
            Observer::ListView => "list_view",
        }
    }
}

/// The focused chunk plus the observer that put it there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub chunk_id: Option<Uuid>,
    pub origin: Option<Observer>,
    /// Incremented on every accepted write.
    pub revision: u64,
}

/// Process-wide owner of the cursor.
#[derive(Clone)]
pub struct CursorCoordinator {
    tx: Arc<watch::Sender<Cursor>>,
}

impl CursorCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Cursor::default());
        Self { tx: Arc::new(tx) }
    }

    /// Point the cursor at `chunk_id` on behalf of `origin`.
    ///
    /// Returns the cursor after the call. When the cursor already points at
    /// `chunk_id` nothing is written, origin included.
    pub fn set_cursor(&self, chunk_id: Option<Uuid>, origin: Observer) -> Cursor {
        write_cursor(&self.tx, chunk_id, origin);
        self.current()
    }

    pub fn current(&self) -> Cursor {
        *self.tx.borrow()
    }

    /// Receiver that sees every later cursor value (latest only).
    pub fn subscribe(&self) -> watch::Receiver<Cursor> {
        self.tx.subscribe()
    }

    /// A handle for one of the two views.
    pub fn observer(&self, who: Observer) -> CursorObserver {
        CursorObserver {
            who,
            tx: Arc::downgrade(&self.tx),
            rx: self.subscribe(),
        }
    }
}

/// Swap in a new cursor unless it already points at `chunk_id`.
fn write_cursor(tx: &watch::Sender<Cursor>, chunk_id: Option<Uuid>, origin: Observer) -> bool {
    let written = tx.send_if_modified(|cursor| {
        if cursor.chunk_id == chunk_id {
            return false;
        }
        cursor.chunk_id = chunk_id;
        cursor.origin = Some(origin);
        cursor.revision += 1;
        true
    });
    trace!(
        component = "cursor",
        origin = origin.as_str(),
        ?chunk_id,
        written,
        "Cursor write"
    );
    written
}

impl Default for CursorCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// One view's side of the cursor protocol.
///
/// Holds the coordinator weakly: once every `CursorCoordinator` clone is
/// dropped, [`CursorObserver::next_request`] returns `None`.
pub struct CursorObserver {
    who: Observer,
    tx: Weak<watch::Sender<Cursor>>,
    rx: watch::Receiver<Cursor>,
}

impl CursorObserver {
    pub fn who(&self) -> Observer {
        self.who
    }

    /// Report a user-driven focus change. Returns `true` if the cursor moved.
    pub fn focus(&self, chunk_id: Uuid) -> bool {
        match self.tx.upgrade() {
            Some(tx) => write_cursor(&tx, Some(chunk_id), self.who),
            None => false,
        }
    }

    /// Whether this view should re-center for `cursor`.
    pub fn should_react(&self, cursor: &Cursor) -> bool {
        cursor.chunk_id.is_some() && cursor.origin == Some(self.who.other())
    }

    /// Wait for the next cursor written by the other view and return the
    /// chunk to re-center on. Echoes of this view's own writes are skipped.
    ///
    /// Returns `None` once the coordinator is gone.
    pub async fn next_request(&mut self) -> Option<Uuid> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let cursor = *self.rx.borrow_and_update();
            if self.should_react(&cursor) {
                return cursor.chunk_id;
            }
        }
    }
}
