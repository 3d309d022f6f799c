//! # Cerebro Ingest - Resilient Telemetry Ingestion
//!
//! Pulls entity health metrics from a remote, rate-limited telemetry API and
//! keeps a locally servable, periodically refreshed snapshot of them for the
//! rest of the Cerebro AIOps platform (dashboards, chat analysis).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            CEREBRO INGEST                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SNAPSHOT CACHE ─► ENTITY CATALOG ─► QUERY EXECUTOR ─► ADMISSION ─► UPSTREAM │
//! │        ▲                 │                                                   │
//! │        └── VALIDITY FILTER ◄┘                                                │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Admission**: minimum request spacing, adaptive backoff and a circuit breaker
//! - **Executor**: one query per call, failure classification, bounded retries
//! - **Catalog**: paginated entity discovery and per-domain metric collection
//! - **Validity**: separates entities with real observed data from silent ones
//! - **Cache**: atomic snapshot swap, single-flight refresh, durable JSON copy
//!
//! ## Author
//!
//! AIOps Team

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod admission;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod snapshot;
pub mod transport;
pub mod types;
pub mod validity;

pub use admission::{AdmissionController, AdmissionStatus};
pub use cache::{CacheState, Diagnosis, SnapshotCache, SnapshotRead, SnapshotSource};
pub use catalog::{CatalogStats, EntityCatalog};
pub use config::IngestConfig;
pub use error::{CircuitOpenError, FailureKind, IngestError, IngestResult, QueryFailure};
pub use executor::{QueryExecutor, QueryOutcome};
pub use snapshot::{Snapshot, SnapshotStore, SnapshotSummary};
pub use transport::{HttpTransport, TelemetryTransport};
pub use types::{
    CircuitState, DataPoint, Entity, EntityDomain, EntityRecord, FieldValue, InvalidReason, MetricBundle,
    ObservationWindow, ValidityVerdict,
};
pub use validity::DataValidityFilter;

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults for every tunable in the pipeline. Configuration overrides them;
// these are what `IngestConfig::default()` reproduces.
// ============================================================================

/// Crate version - follows semantic versioning
pub const INGEST_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const INGEST_NAME: &str = "cerebro-ingest";
pub const INGEST_FULL_NAME: &str = "Cerebro Telemetry Ingest";

// ----------------------------------------------------------------------------
// Upstream
// ----------------------------------------------------------------------------

/// Default GraphQL endpoint of the telemetry API
pub const DEFAULT_UPSTREAM_ENDPOINT: &str = "https://api.newrelic.com/graphql";

/// Default per-request timeout (seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Header carrying the static API key
pub const API_KEY_HEADER: &str = "Api-Key";

// ----------------------------------------------------------------------------
// Admission Control
// ----------------------------------------------------------------------------

/// Minimum spacing between two outbound requests (milliseconds)
pub const DEFAULT_MIN_SPACING_MS: u64 = 1_000;

/// Base of the adaptive backoff exponent
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// Cap applied to the adaptive backoff exponent
pub const DEFAULT_BACKOFF_EXPONENT_CAP: u32 = 8;

/// Adaptive backoff only kicks in above this many consecutive failures
pub const DEFAULT_BACKOFF_AFTER_FAILURES: u32 = 3;

/// Ceiling for any single admission delay (seconds)
pub const DEFAULT_MAX_ADMISSION_DELAY_SECS: u64 = 300;

/// Jitter added on top of the adaptive delay, as a fraction of it
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Consecutive-failure tally that opens the circuit
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

/// Weight of a rate-limit failure on the consecutive-failure tally
pub const RATE_LIMIT_FAILURE_WEIGHT: u32 = 2;

/// Time the circuit stays open before a half-open trial request (seconds)
pub const DEFAULT_COOL_DOWN_SECS: u64 = 60;

/// Consecutive half-open successes needed to close the circuit
pub const DEFAULT_HALF_OPEN_SUCCESSES: u32 = 3;

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Attempts per query, first attempt included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// First backoff after a throttled response without a retry hint (seconds)
pub const DEFAULT_RATE_LIMIT_BACKOFF_SECS: u64 = 60;

/// Ceiling for throttling backoff and honoured retry hints (seconds)
pub const DEFAULT_RATE_LIMIT_BACKOFF_CAP_SECS: u64 = 300;

/// First backoff after a 5xx response (seconds)
pub const DEFAULT_SERVER_ERROR_BACKOFF_SECS: u64 = 5;

/// Ceiling for 5xx backoff (seconds)
pub const DEFAULT_SERVER_ERROR_BACKOFF_CAP_SECS: u64 = 60;

/// First backoff after a timeout or connection error (seconds)
pub const DEFAULT_TRANSPORT_BACKOFF_SECS: u64 = 1;

// ----------------------------------------------------------------------------
// Catalog & Cache
// ----------------------------------------------------------------------------

/// Safety cap on discovery pages
pub const DEFAULT_DISCOVERY_PAGE_LIMIT: u32 = 50;

/// Entities collected concurrently during a refresh
pub const DEFAULT_COLLECTION_CONCURRENCY: usize = 5;

/// Background refresh interval (seconds)
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3_600;

/// Overall deadline for one refresh cycle (seconds)
pub const DEFAULT_REFRESH_DEADLINE_SECS: u64 = 600;

/// Grace period granted to an in-flight refresh on shutdown (seconds)
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Default location of the durable snapshot
pub const DEFAULT_SNAPSHOT_PATH: &str = "historico/cache_completo.json";
