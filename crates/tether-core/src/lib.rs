//! # tether-core
//!
//! Core types, traits, and abstractions for tether, the progressive
//! connection-detection pipeline.
//!
//! This crate provides the data model (chunks, connections, detection jobs),
//! the repository and detector traits the other crates implement, the event
//! bus for live progress, and the cursor coordinator that keeps the reader
//! and chunk list focused on the same chunk.

pub mod cursor;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod stats;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use cursor::{Cursor, CursorCoordinator, CursorObserver, Observer};
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, ServerEvent};
pub use models::*;
pub use stats::{CorpusStats, DocumentStats};
pub use traits::*;
pub use uuid_utils::{extract_timestamp, new_v7};
