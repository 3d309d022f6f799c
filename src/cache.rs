// ============================================================================
// SNAPSHOT CACHE
// ============================================================================
// Owns the published snapshot and its durable copy:
// - Lock-free reads through `ArcSwapOption`
// - Single-flight refresh in a spawned task, joined through a watch channel
// - Background cycle with graceful shutdown
// ============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionStatus};
use crate::catalog::{CatalogStats, EntityCatalog};
use crate::config::{CacheConfig, IngestConfig};
use crate::error::{IngestError, IngestResult};
use crate::executor::QueryExecutor;
use crate::logging::{RefreshStage, StageTimer, StageTimings};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::transport::TelemetryTransport;
use crate::types::{EntityDomain, EntityRecord};
use crate::validity::DataValidityFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheState {
    /// Nothing published yet
    Empty,
    Ready,
    /// A refresh is running; readers still see the previous snapshot
    Refreshing,
    /// The last refresh failed; the previous snapshot is still served
    ReadyStale,
}

/// Where the current snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Network,
    Disk,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotRead {
    NotInitialized,
    Ready { snapshot: Arc<Snapshot>, stale: bool },
}

/// Everything an operator needs to judge cache health
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub state: CacheState,
    pub total_entities: usize,
    pub entities_with_data: usize,
    pub per_domain: BTreeMap<EntityDomain, usize>,
    pub entities_pending: usize,
    pub snapshot_generated_at: Option<DateTime<Utc>>,
    /// Age of the current snapshot at the time of the diagnosis
    pub snapshot_age_secs: Option<f64>,
    /// The current snapshot is younger than the refresh interval
    pub fresh: bool,
    pub snapshot_file_bytes: Option<u64>,
    pub source: Option<SnapshotSource>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub last_error: Option<String>,
    pub last_error_category: Option<String>,
    pub last_persist_error: Option<String>,
    pub refresh_count: u64,
    pub failure_count: u64,
    pub last_stage_timings: Option<StageTimings>,
    pub snapshot_path: PathBuf,
    pub catalog: CatalogStats,
    pub admission: AdmissionStatus,
}

#[derive(Debug, Default)]
struct RefreshHistory {
    last_refresh_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_category: Option<&'static str>,
    last_persist_error: Option<String>,
    stale: bool,
    refresh_count: u64,
    failure_count: u64,
    last_timings: Option<StageTimings>,
    source: Option<SnapshotSource>,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    rx: watch::Receiver<Option<bool>>,
    abort: AbortHandle,
}

/// Clears the in-flight slot when the refresh task ends or is aborted
struct InFlightGuard {
    cache: Arc<SnapshotCache>,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slot = self.cache.in_flight.lock();
        if slot.as_ref().map(|f| f.generation) == Some(self.generation) {
            *slot = None;
        }
    }
}

#[derive(Debug)]
struct RefreshReport {
    entities: usize,
    with_data: usize,
    pending: usize,
    persist_error: Option<String>,
    timings: StageTimings,
}

pub struct SnapshotCache {
    catalog: Arc<EntityCatalog>,
    admission: Arc<AdmissionController>,
    filter: DataValidityFilter,
    store: SnapshotStore,
    config: CacheConfig,
    current: ArcSwapOption<Snapshot>,
    in_flight: Mutex<Option<InFlight>>,
    generation: Mutex<u64>,
    history: RwLock<RefreshHistory>,
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SnapshotCache {
    pub fn new(catalog: Arc<EntityCatalog>, admission: Arc<AdmissionController>, config: CacheConfig) -> Self {
        Self {
            catalog,
            admission,
            filter: DataValidityFilter::new(),
            store: SnapshotStore::new(config.snapshot_path.clone()),
            config,
            current: ArcSwapOption::empty(),
            in_flight: Mutex::new(None),
            generation: Mutex::new(0),
            history: RwLock::new(RefreshHistory::default()),
        }
    }

    /// Wire admission, executor, catalog and cache from one configuration
    pub fn build(config: &IngestConfig, transport: Arc<dyn TelemetryTransport>) -> Arc<Self> {
        let admission = Arc::new(AdmissionController::new(config.admission.clone()));
        let executor = Arc::new(QueryExecutor::new(
            transport,
            Arc::clone(&admission),
            config.retry.clone(),
            config.upstream.account_id.unwrap_or_default(),
        ));
        let catalog = Arc::new(EntityCatalog::new(
            executor,
            config.catalog.clone(),
            config.upstream.request_timeout,
        ));
        Arc::new(Self::new(catalog, admission, config.cache.clone()))
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Current snapshot, never waits on I/O
    pub fn read(&self) -> SnapshotRead {
        match self.current.load_full() {
            None => SnapshotRead::NotInitialized,
            Some(snapshot) => SnapshotRead::Ready {
                snapshot,
                stale: self.history.read().stale,
            },
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    pub fn state(&self) -> CacheState {
        if self.is_refreshing() {
            CacheState::Refreshing
        } else if self.current.load().is_none() {
            CacheState::Empty
        } else if self.history.read().stale {
            CacheState::ReadyStale
        } else {
            CacheState::Ready
        }
    }

    pub fn diagnose(&self) -> Diagnosis {
        let state = self.state();
        let snapshot = self.current.load_full();
        let history = self.history.read();
        let summary = snapshot.as_ref().map(|s| s.summary.clone()).unwrap_or_default();
        let age = snapshot.as_deref().map(snapshot_age);

        Diagnosis {
            state,
            total_entities: summary.total_entities,
            entities_with_data: summary.entities_with_data,
            per_domain: summary.per_domain,
            entities_pending: summary.entities_pending,
            snapshot_generated_at: snapshot.as_ref().map(|s| s.generated_at),
            snapshot_age_secs: age.map(|a| a.as_secs_f64()),
            fresh: age.map_or(false, |a| a < self.config.refresh_interval),
            snapshot_file_bytes: std::fs::metadata(self.store.path()).ok().map(|m| m.len()),
            source: history.source,
            last_refresh_at: history.last_refresh_at,
            last_attempt_at: history.last_attempt_at,
            stale: history.stale,
            last_error: history.last_error.clone(),
            last_error_category: history.last_error_category.map(str::to_string),
            last_persist_error: history.last_persist_error.clone(),
            refresh_count: history.refresh_count,
            failure_count: history.failure_count,
            last_stage_timings: history.last_timings,
            snapshot_path: self.store.path().to_path_buf(),
            catalog: self.catalog.stats(),
            admission: self.admission.status(),
        }
    }

    /// Seed memory from the durable file. Returns whether a snapshot was found.
    pub fn load_from_disk(&self) -> IngestResult<bool> {
        match self.store.load()? {
            Some(snapshot) => {
                self.current.store(Some(Arc::new(snapshot)));
                self.history.write().source = Some(SnapshotSource::Disk);
                Ok(true)
            }
            None => {
                info!(
                    target: "cerebro::cache",
                    path = %self.store.path().display(),
                    "No snapshot on disk yet"
                );
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    /// Refresh now, or join the refresh already running. Every caller of the
    /// same refresh gets the same result.
    pub async fn force_refresh(self: &Arc<Self>) -> bool {
        let mut rx = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!(target: "cerebro::cache", "Joining in-flight refresh");
                    in_flight.rx.clone()
                }
                None => {
                    let generation = {
                        let mut next = self.generation.lock();
                        *next += 1;
                        *next
                    };
                    let (tx, rx) = watch::channel(None);
                    let guard = InFlightGuard {
                        cache: Arc::clone(self),
                        generation,
                    };
                    let handle = tokio::spawn(async move {
                        let ok = guard.cache.run_refresh().await;
                        drop(guard);
                        let _ = tx.send(Some(ok));
                    });
                    *slot = Some(InFlight {
                        generation,
                        rx: rx.clone(),
                        abort: handle.abort_handle(),
                    });
                    rx
                }
            }
        };

        // The sender is dropped without a value when the refresh is aborted.
        let outcome = rx.wait_for(Option::is_some).await.map(|value| *value == Some(true));
        outcome.unwrap_or(false)
    }

    /// Refresh every `interval` until `shutdown` fires, then give an
    /// in-flight refresh `shutdown_grace` to finish before abandoning it.
    /// A snapshot younger than `interval` postpones the first refresh until
    /// it comes of age.
    pub async fn background_cycle(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let first_in = self.first_refresh_delay(interval);
        let mut ticker = tokio::time::interval_at(Instant::now() + first_in, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target: "cerebro::cache",
            interval = %humantime::format_duration(interval),
            first_refresh_in = %humantime::format_duration(first_in),
            "Background refresh cycle started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        ok = self.force_refresh() => {
                            debug!(target: "cerebro::cache", success = ok, "Scheduled refresh finished");
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.drain(self.config.shutdown_grace).await;
        info!(target: "cerebro::cache", "Background refresh cycle stopped");
    }

    fn first_refresh_delay(&self, interval: Duration) -> Duration {
        match self.current.load_full() {
            Some(snapshot) => interval.saturating_sub(snapshot_age(&snapshot)),
            None => Duration::ZERO,
        }
    }

    /// Wait up to `grace` for the running refresh, then abort it
    pub async fn drain(&self, grace: Duration) {
        let in_flight = self
            .in_flight
            .lock()
            .as_ref()
            .map(|f| (f.rx.clone(), f.abort.clone()));
        let Some((mut rx, abort)) = in_flight else {
            return;
        };

        info!(
            target: "cerebro::cache",
            grace = %humantime::format_duration(grace),
            "Waiting for in-flight refresh"
        );
        let finished = tokio::time::timeout(grace, rx.wait_for(Option::is_some))
            .await
            .is_ok();
        if !finished {
            warn!(target: "cerebro::cache", "Refresh did not finish within grace period, abandoning it");
            abort.abort();
            self.record_failure(&IngestError::ShuttingDown);
        }
    }

    async fn run_refresh(&self) -> bool {
        self.history.write().last_attempt_at = Some(Utc::now());

        match self.refresh_once().await {
            Ok(report) => {
                let mut history = self.history.write();
                history.last_refresh_at = Some(Utc::now());
                history.stale = false;
                history.last_error = None;
                history.last_error_category = None;
                history.last_persist_error = report.persist_error;
                history.last_timings = Some(report.timings);
                history.refresh_count += 1;
                history.source = Some(SnapshotSource::Network);
                info!(
                    target: "cerebro::cache",
                    entities = report.entities,
                    with_data = report.with_data,
                    pending = report.pending,
                    elapsed_ms = report.timings.total_ms(),
                    "Snapshot refreshed"
                );
                true
            }
            Err(err) => {
                self.record_failure(&err);
                false
            }
        }
    }

    /// Mark the cycle failed; the previous snapshot keeps being served
    fn record_failure(&self, err: &IngestError) {
        let mut history = self.history.write();
        history.stale = true;
        history.failure_count += 1;
        history.last_error = Some(err.to_string());
        history.last_error_category = Some(err.category());
        error!(
            target: "cerebro::cache",
            error = %err,
            category = err.category(),
            hint = ?err.recovery_hint(),
            "Refresh failed, keeping previous snapshot"
        );
    }

    async fn refresh_once(&self) -> IngestResult<RefreshReport> {
        let deadline = Instant::now() + self.config.refresh_deadline;
        let mut timings = StageTimings::default();

        let timer = StageTimer::with_budget(RefreshStage::Discovery, self.config.refresh_deadline);
        let entities = tokio::time::timeout_at(deadline, self.catalog.discover_entities())
            .await
            .map_err(|_| IngestError::DeadlineExceeded { stage: "discovery" })??;
        timer.finish(&mut timings);

        let total = entities.len();
        let failed_before = self.catalog.stats().queries_failed;
        let windows = self.catalog.windows().to_vec();
        let mut completed: Vec<(usize, EntityRecord)> = Vec::with_capacity(total);

        let timer = StageTimer::with_budget(
            RefreshStage::Collection,
            deadline.saturating_duration_since(Instant::now()),
        );
        {
            let catalog = &self.catalog;
            let windows = &windows;
            let mut collections = stream::iter(entities.into_iter().enumerate())
                .map(|(index, entity)| async move {
                    let result = catalog.collect_metrics(&entity, windows).await;
                    (index, entity, result)
                })
                .buffer_unordered(self.catalog.concurrency());

            let expiry = tokio::time::sleep_until(deadline);
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    biased;
                    next = collections.next() => match next {
                        Some((index, entity, Ok(metrics))) => {
                            let verdict = self.filter.has_real_data(&metrics);
                            completed.push((index, EntityRecord { entity, metrics, verdict }));
                        }
                        Some((_, entity, Err(err))) => {
                            warn!(
                                target: "cerebro::cache",
                                entity = %entity.name,
                                error = %err,
                                "Collection aborted"
                            );
                            return Err(err);
                        }
                        None => break,
                    },
                    _ = &mut expiry => {
                        warn!(
                            target: "cerebro::cache",
                            completed = completed.len(),
                            pending = total - completed.len(),
                            "Refresh deadline reached, publishing completed entities"
                        );
                        break;
                    }
                }
            }
        }

        timer.finish(&mut timings);

        // Nothing collected in time: the previous snapshot is the better answer.
        if completed.is_empty() && total > 0 {
            return Err(IngestError::DeadlineExceeded { stage: "collection" });
        }

        completed.sort_by_key(|(index, _)| *index);
        let records: Vec<EntityRecord> = completed.into_iter().map(|(_, record)| record).collect();
        let pending = total - records.len();
        let queries_failed = self.catalog.stats().queries_failed.saturating_sub(failed_before);

        let snapshot = Arc::new(Snapshot::assemble(records, pending, queries_failed));
        self.current.store(Some(Arc::clone(&snapshot)));

        let timer = StageTimer::start(RefreshStage::Persist);
        let persisted = self.persist(Arc::clone(&snapshot)).await;
        timer.finish(&mut timings);

        let persist_error = match persisted {
            Ok(()) => None,
            Err(err) => {
                error!(
                    target: "cerebro::cache",
                    error = %err,
                    path = %self.store.path().display(),
                    "Snapshot persist failed, serving in-memory copy"
                );
                Some(err.to_string())
            }
        };

        Ok(RefreshReport {
            entities: snapshot.summary.total_entities,
            with_data: snapshot.summary.entities_with_data,
            pending,
            persist_error,
            timings,
        })
    }

    async fn persist(&self, snapshot: Arc<Snapshot>) -> IngestResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.persist(&snapshot))
            .await
            .map_err(|e| IngestError::Internal(format!("persist task failed: {}", e)))??;
        Ok(())
    }
}

fn snapshot_age(snapshot: &Snapshot) -> Duration {
    (Utc::now() - snapshot.generated_at).to_std().unwrap_or(Duration::ZERO)
}
