// ============================================================================
// ADMISSION CONTROL
// ============================================================================
// Every outbound query passes through here first:
// - Minimum spacing between admissions, shared by all concurrent callers
// - Adaptive delay once consecutive failures pile up
// - Circuit breaker (CLOSED -> OPEN -> HALF_OPEN -> CLOSED)
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AdmissionConfig;
use crate::error::CircuitOpenError;
use crate::types::CircuitState;
use crate::RATE_LIMIT_FAILURE_WEIGHT;

/// Point-in-time view of the controller, for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Seconds until a half-open trial request is allowed, while OPEN
    pub retry_in_secs: Option<f64>,
    /// Adaptive delay currently added to each admission, jitter excluded
    pub adaptive_delay_secs: f64,
    pub admitted_total: u64,
    pub rejected_total: u64,
}

#[derive(Debug)]
struct AdmissionInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Earliest instant the next caller may be admitted
    next_slot: Option<Instant>,
}

/// Combined rate limiter and circuit breaker. One per process.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    inner: Mutex<AdmissionInner>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(AdmissionInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                next_slot: None,
            }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Wait for a slot. Fails fast while the circuit is open and the
    /// cool-down has not elapsed; nothing should be sent in that case.
    pub async fn await_admission(&self) -> Result<(), CircuitOpenError> {
        let wake = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            self.refresh_state(&mut inner, now);
            if let Some(retry_in) = self.open_remaining(&inner, now) {
                self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(CircuitOpenError { retry_in });
            }

            let slot = match inner.next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            let wake = slot + self.delay_with_jitter(inner.consecutive_failures);
            inner.next_slot = Some(wake + self.config.min_spacing);
            wake
        };

        if wake > Instant::now() {
            debug!(
                target: "cerebro::admission",
                wait_ms = wake.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Waiting for admission slot"
            );
            tokio::time::sleep_until(wake).await;
        }

        // The circuit may have opened while we slept.
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh_state(&mut inner, now);
        if let Some(retry_in) = self.open_remaining(&inner, now) {
            self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(CircuitOpenError { retry_in });
        }

        self.admitted.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Record a successful upstream call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.refresh_state(&mut inner, Instant::now());
        inner.consecutive_failures = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.half_open_successes {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    info!(target: "cerebro::admission", "Circuit closed");
                }
            }
            CircuitState::Closed => {
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed upstream call. Throttling weighs double on the tally.
    pub fn record_failure(&self, is_rate_limit: bool) {
        let weight = if is_rate_limit { RATE_LIMIT_FAILURE_WEIGHT } else { 1 };
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh_state(&mut inner, now);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(weight);
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        target: "cerebro::admission",
                        failures = inner.consecutive_failures,
                        cool_down_secs = self.config.cool_down.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(
                    target: "cerebro::admission",
                    rate_limited = is_rate_limit,
                    "Half-open trial failed, circuit reopened"
                );
            }
            CircuitState::Open => {}
        }
    }

    pub fn status(&self) -> AdmissionStatus {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh_state(&mut inner, now);
        AdmissionStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            retry_in_secs: self.open_remaining(&inner, now).map(|d| d.as_secs_f64()),
            adaptive_delay_secs: self.adaptive_delay(inner.consecutive_failures).as_secs_f64(),
            admitted_total: self.admitted.load(AtomicOrdering::Relaxed),
            rejected_total: self.rejected.load(AtomicOrdering::Relaxed),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.status().state
    }

    /// Extra delay for a failure tally: `base^min(n, cap)` seconds, bounded
    /// by `max_delay`, once the tally exceeds `backoff_after_failures`.
    pub fn adaptive_delay(&self, failures: u32) -> Duration {
        if failures <= self.config.backoff_after_failures {
            return Duration::ZERO;
        }
        let exponent = failures.min(self.config.backoff_exponent_cap) as i32;
        let secs = self.config.backoff_base.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        Duration::from_secs_f64(secs.min(max))
    }

    fn delay_with_jitter(&self, failures: u32) -> Duration {
        let delay = self.adaptive_delay(failures);
        if delay.is_zero() || self.config.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter = delay.as_secs_f64() * self.config.jitter_ratio * rand::thread_rng().gen::<f64>();
        (delay + Duration::from_secs_f64(jitter)).min(self.config.max_delay)
    }

    /// Upper bound of the delay the next admission will add, jitter included
    pub fn upcoming_delay_ceiling(&self) -> Duration {
        let failures = self.inner.lock().consecutive_failures;
        let delay = self.adaptive_delay(failures);
        let ceiling = delay.as_secs_f64() * (1.0 + self.config.jitter_ratio.max(0.0));
        Duration::from_secs_f64(ceiling).min(self.config.max_delay)
    }

    /// OPEN -> HALF_OPEN once the cool-down has elapsed
    fn refresh_state(&self, inner: &mut AdmissionInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map_or(true, |opened| now.saturating_duration_since(opened) >= self.config.cool_down);
        if cooled {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            info!(target: "cerebro::admission", "Circuit half-open, probing upstream");
        }
    }

    fn open_remaining(&self, inner: &AdmissionInner, now: Instant) -> Option<Duration> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened = inner.opened_at?;
        Some((opened + self.config.cool_down).saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionConfig::default())
    }

    fn open(controller: &AdmissionController) {
        for _ in 0..5 {
            controller.record_failure(true);
        }
        assert_eq!(controller.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_counts_rate_limits_double() {
        let ctl = controller();
        for _ in 0..9 {
            ctl.record_failure(false);
        }
        assert_eq!(ctl.state(), CircuitState::Closed);
        ctl.record_failure(false);
        assert_eq!(ctl.state(), CircuitState::Open);

        let ctl = controller();
        for _ in 0..4 {
            ctl.record_failure(true);
        }
        assert_eq!(ctl.status().consecutive_failures, 8);
        assert_eq!(ctl.state(), CircuitState::Closed);
        ctl.record_failure(true);
        assert_eq!(ctl.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_fast_while_open() {
        let ctl = controller();
        open(&ctl);

        let started = Instant::now();
        let err = ctl.await_admission().await.unwrap_err();
        assert_eq!(Instant::now(), started);
        assert_eq!(err.retry_in, Duration::from_secs(60));

        let status = ctl.status();
        assert_eq!(status.rejected_total, 1);
        assert_eq!(status.admitted_total, 0);
        assert_eq!(status.retry_in_secs, Some(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_observes_half_open_after_cool_down() {
        let ctl = controller();
        open(&ctl);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(ctl.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;

        let status = ctl.status();
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert_eq!(status.retry_in_secs, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_needs_three_successes() {
        let ctl = controller();
        open(&ctl);
        tokio::time::advance(Duration::from_secs(60)).await;

        ctl.record_success();
        ctl.record_success();
        assert_eq!(ctl.state(), CircuitState::HalfOpen);
        ctl.record_success();
        assert_eq!(ctl.state(), CircuitState::Closed);
        assert_eq!(ctl.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        let ctl = controller();
        open(&ctl);
        tokio::time::advance(Duration::from_secs(60)).await;
        ctl.record_success();
        assert_eq!(ctl.state(), CircuitState::HalfOpen);

        ctl.record_failure(false);
        assert_eq!(ctl.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let status = ctl.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.retry_in_secs, Some(30.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_tally() {
        let ctl = controller();
        ctl.record_failure(true);
        ctl.record_failure(false);
        assert_eq!(ctl.status().consecutive_failures, 3);
        ctl.record_success();
        assert_eq!(ctl.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_holds_across_concurrent_callers() {
        let ctl = Arc::new(controller());
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let ctl = Arc::clone(&ctl);
            handles.push(tokio::spawn(async move {
                ctl.await_admission().await.unwrap();
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap() - start);
        }
        admitted.sort();
        assert_eq!(
            admitted,
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(ctl.status().admitted_total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_delay_bounds() {
        let ctl = controller();
        assert_eq!(ctl.adaptive_delay(3), Duration::ZERO);
        assert_eq!(ctl.adaptive_delay(4), Duration::from_secs(16));
        assert_eq!(ctl.adaptive_delay(8), Duration::from_secs(256));
        assert_eq!(ctl.adaptive_delay(20), Duration::from_secs(256));

        let mut config = AdmissionConfig::default();
        config.backoff_base = 3.0;
        let ctl = AdmissionController::new(config);
        assert_eq!(ctl.adaptive_delay(8), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upcoming_delay_ceiling_includes_jitter_and_cap() {
        let ctl = controller();
        assert_eq!(ctl.upcoming_delay_ceiling(), Duration::ZERO);
        for _ in 0..4 {
            ctl.record_failure(false);
        }
        let ceiling = ctl.upcoming_delay_ceiling().as_secs_f64();
        assert!((ceiling - 17.6).abs() < 1e-6, "ceiling {}", ceiling);

        let mut config = AdmissionConfig::default();
        config.backoff_base = 3.0;
        config.failure_threshold = 100;
        let ctl = AdmissionController::new(config);
        for _ in 0..8 {
            ctl.record_failure(false);
        }
        assert_eq!(ctl.upcoming_delay_ceiling(), Duration::from_secs(300));

        let start = Instant::now();
        ctl.await_admission().await.unwrap();
        assert!(Instant::now() - start <= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_delay_applied_with_jitter() {
        let ctl = controller();
        for _ in 0..4 {
            ctl.record_failure(false);
        }

        let start = Instant::now();
        ctl.await_admission().await.unwrap();
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(16), "waited {:?}", waited);
        assert!(waited <= Duration::from_secs_f64(17.6), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rechecks_circuit_after_wait() {
        let ctl = Arc::new(controller());
        for _ in 0..4 {
            ctl.record_failure(false);
        }

        let waiter = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.await_admission().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        for _ in 0..6 {
            ctl.record_failure(false);
        }
        assert_eq!(ctl.state(), CircuitState::Open);

        assert!(waiter.await.unwrap().is_err());
        assert_eq!(ctl.status().admitted_total, 0);
    }
}
