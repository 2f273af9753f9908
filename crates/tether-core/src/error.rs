//! Error types for tether.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using tether's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tether operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Chunk not found
    #[error("Chunk not found: {0}")]
    ChunkNotFound(Uuid),

    /// Detection job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// A non-terminal detection job already exists for the document.
    #[error("Detection already in progress for document {document_id} (job {job_id:?})")]
    AlreadyInProgress {
        document_id: Uuid,
        /// The active job, when it could be resolved.
        job_id: Option<Uuid>,
    },

    /// The external detector failed for a single chunk
    #[error("Detector error: {0}")]
    Detector(String),

    /// The worker running a job died or lost its storage
    #[error("Worker aborted: {0}")]
    WorkerAborted(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for every "unknown document/chunk/job" variant.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::DocumentNotFound(_)
                | Error::ChunkNotFound(_)
                | Error::JobNotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_document_not_found() {
        let id = Uuid::nil();
        let err = Error::DocumentNotFound(id);
        assert_eq!(err.to_string(), format!("Document not found: {}", id));
    }

    #[test]
    fn test_error_display_already_in_progress() {
        let document_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        let err = Error::AlreadyInProgress {
            document_id,
            job_id: Some(job_id),
        };
        let msg = err.to_string();
        assert!(msg.contains(&document_id.to_string()));
        assert!(msg.contains(&job_id.to_string()));
    }

    #[test]
    fn test_error_display_detector() {
        let err = Error::Detector("model timeout".to_string());
        assert_eq!(err.to_string(), "Detector error: model timeout");
    }

    #[test]
    fn test_error_display_worker_aborted() {
        let err = Error::WorkerAborted("task panicked".to_string());
        assert_eq!(err.to_string(), "Worker aborted: task panicked");
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(Error::DocumentNotFound(Uuid::nil()).is_not_found());
        assert!(Error::ChunkNotFound(Uuid::nil()).is_not_found());
        assert!(Error::JobNotFound(Uuid::nil()).is_not_found());
        assert!(!Error::Detector("x".into()).is_not_found());
        assert!(!Error::AlreadyInProgress {
            document_id: Uuid::nil(),
            job_id: None
        }
        .is_not_found());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
