//! Structured logging schema and field name constants for tether.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation can query by the same names in every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Per-chunk detector failures, reaped jobs, fallbacks |
//! | INFO  | Lifecycle events (startup, shutdown), job start/finish |
//! | DEBUG | Decision points, scope resolution, config choices |
//! | TRACE | Per-chunk iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "db", "jobs", "sync"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "worker", "orchestrator", "reaper", "cursor"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "request_detection", "claim_next", "run_job"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Document UUID being operated on.
pub const DOCUMENT_ID: &str = "document_id";

/// Chunk UUID being operated on.
pub const CHUNK_ID: &str = "chunk_id";

/// Detection job UUID.
pub const JOB_ID: &str = "job_id";

/// Job scope kind ("full", "selective", "single").
pub const SCOPE: &str = "scope";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of chunks resolved for a job.
pub const CHUNK_COUNT: &str = "chunk_count";

/// Number of connections stored for a chunk.
pub const CONNECTION_COUNT: &str = "connection_count";

/// Number of per-chunk detector failures in a job.
pub const FAILURE_COUNT: &str = "failure_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
