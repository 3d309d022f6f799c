// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging on `tracing`:
// - JSON, compact or pretty output
// - Config level as default directive, RUST_LOG overrides
// - Stage timers for the refresh cycle
// ============================================================================

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{IngestError, IngestResult};

/// Map a configured level name to a filter; unknown names fall back to info
pub fn level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        "off" => tracing::level_filters::LevelFilter::OFF,
        _ => tracing::level_filters::LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> IngestResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| IngestError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| IngestError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| IngestError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "cerebro::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// Refresh Stage Timing
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStage {
    Discovery,
    Collection,
    Persist,
}

impl RefreshStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStage::Discovery => "discovery",
            RefreshStage::Collection => "collection",
            RefreshStage::Persist => "persist",
        }
    }
}

/// Wall time spent in each stage of the last refresh, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub discovery_ms: u64,
    pub collection_ms: u64,
    pub persist_ms: u64,
}

impl StageTimings {
    pub fn total_ms(&self) -> u64 {
        self.discovery_ms + self.collection_ms + self.persist_ms
    }

    fn slot(&mut self, stage: RefreshStage) -> &mut u64 {
        match stage {
            RefreshStage::Discovery => &mut self.discovery_ms,
            RefreshStage::Collection => &mut self.collection_ms,
            RefreshStage::Persist => &mut self.persist_ms,
        }
    }
}

/// Times one refresh stage on the runtime clock. A stage dropped without
/// `finish` was cut short by an error and is logged as abandoned.
#[derive(Debug)]
pub struct StageTimer {
    stage: RefreshStage,
    start: Instant,
    budget: Option<Duration>,
    finished: bool,
}

impl StageTimer {
    pub fn start(stage: RefreshStage) -> Self {
        Self {
            stage,
            start: Instant::now(),
            budget: None,
            finished: false,
        }
    }

    /// Warn when the stage runs past `budget`
    pub fn with_budget(stage: RefreshStage, budget: Duration) -> Self {
        Self {
            stage,
            start: Instant::now(),
            budget: Some(budget),
            finished: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the stage into `timings`
    pub fn finish(mut self, timings: &mut StageTimings) -> Duration {
        self.finished = true;
        let elapsed = self.elapsed();
        *timings.slot(self.stage) = elapsed.as_millis() as u64;

        match self.budget {
            Some(budget) if elapsed > budget => warn!(
                target: "cerebro::perf",
                stage = self.stage.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "Refresh stage over budget"
            ),
            _ => debug!(
                target: "cerebro::perf",
                stage = self.stage.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Refresh stage finished"
            ),
        }
        elapsed
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                target: "cerebro::perf",
                stage = self.stage.as_str(),
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Refresh stage abandoned"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_level_filter_names() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("off"), LevelFilter::OFF);
        assert_eq!(level_filter("verbose"), LevelFilter::INFO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timer_records_its_own_slot() {
        let mut timings = StageTimings::default();

        let timer = StageTimer::with_budget(RefreshStage::Collection, Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(timer.finish(&mut timings), Duration::from_millis(1_500));

        let timer = StageTimer::start(RefreshStage::Persist);
        tokio::time::advance(Duration::from_millis(20)).await;
        timer.finish(&mut timings);

        assert_eq!(
            timings,
            StageTimings {
                discovery_ms: 0,
                collection_ms: 1_500,
                persist_ms: 20,
            }
        );
        assert_eq!(timings.total_ms(), 1_520);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_stage_leaves_timings_untouched() {
        let mut timings = StageTimings::default();
        {
            let _timer = StageTimer::start(RefreshStage::Discovery);
            tokio::time::advance(Duration::from_secs(3)).await;
        }
        assert_eq!(timings, StageTimings::default());
    }
}
