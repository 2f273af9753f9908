//! Centralized default constants for tether.
//!
//! Every crate reads its defaults from here rather than defining its own
//! magic numbers. Organized by domain area.

// =============================================================================
// CHUNK LISTING
// =============================================================================

/// Preview length in characters for chunk list projections.
pub const SNIPPET_LENGTH: usize = 200;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// SSE keep-alive interval in seconds.
pub const SSE_KEEPALIVE_SECS: u64 = 15;

/// Default CORS max-age in seconds (1 hour).
pub const CORS_MAX_AGE_SECS: u64 = 3600;

// =============================================================================
// DETECTION WORKER
// =============================================================================

/// Safety-net poll interval in milliseconds.
///
/// The worker is woken through the job repository's notifier when a job is
/// queued; polling only covers jobs inserted by another process.
pub const DETECTION_POLL_INTERVAL_MS: u64 = 500;

/// Maximum detection jobs run concurrently (one job per document).
pub const DETECTION_MAX_CONCURRENT: usize = 4;

/// Timeout for a single detector call in seconds.
pub const DETECTION_CHUNK_TIMEOUT_SECS: u64 = 120;

/// Interval between stale-job sweeps in seconds.
pub const REAP_INTERVAL_SECS: u64 = 60;

// =============================================================================
// DETECTOR
// =============================================================================

/// HTTP timeout for the remote detector in seconds.
pub const DETECTOR_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// DATABASE
// =============================================================================

/// Pool connections reserved for API requests on top of one per
/// concurrently running detection job.
pub const DB_API_CONNECTIONS: u32 = 6;

/// Seconds to wait for a pooled connection before failing the query.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;
