//! # tether-jobs
//!
//! Detection job orchestration for tether.
//!
//! This crate provides:
//! - [`DetectionService`], the entry point for every detection request
//! - [`DetectionWorker`], which claims jobs and runs the detector chunk by chunk
//! - [`HttpDetector`], a detector backed by an external HTTP service
//! - [`JobReaper`], which fails jobs that stopped reporting progress
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_core::{EventBus, JobScope, CreatedBy};
//! use tether_db::MemoryStore;
//! use tether_jobs::{DetectionService, HttpDetector, WorkerBuilder, WorkerConfig};
//!
//! let repos = MemoryStore::new().repositories();
//! let service = DetectionService::new(repos.clone(), Arc::new(EventBus::default()));
//!
//! let detector = HttpDetector::from_env()?.ok_or("DETECTOR_URL not set")?;
//! let worker = WorkerBuilder::new(repos)
//!     .with_config(WorkerConfig::from_env())
//!     .with_detector(detector)
//!     .build()?;
//! let handle = worker.start();
//!
//! let job_id = service.request_detection(doc_id, JobScope::Full, CreatedBy::User).await?;
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! handle.shutdown().await?;
//! ```

pub mod detector;
pub mod orchestrator;
pub mod reaper;
pub mod worker;

pub use detector::{HttpDetector, HttpDetectorConfig};
pub use orchestrator::DetectionService;
pub use reaper::{JobReaper, ReaperConfig, ReaperHandle};
pub use worker::{DetectionWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

/// Default polling interval for job processing (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = tether_core::defaults::DETECTION_POLL_INTERVAL_MS;
