//! Dispatcher health: counters, derived status, and the periodic ticker.
//!
//! Status is never set directly. It is a pure function of the error rate and
//! the heartbeat age, evaluated by [`evaluate`] on every health check and on
//! each ticker pass:
//!
//! | condition | status |
//! |-----------|--------|
//! | error rate > 0.10 or heartbeat age > 60s | unhealthy |
//! | error rate > 0.05 or heartbeat age > 30s | degraded |
//! | otherwise | healthy |

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::message::epoch_ms;

// =============================================================================
// Status
// =============================================================================

/// Derived health classification, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Thresholds for [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub degraded_heartbeat_ms: u64,
    pub unhealthy_heartbeat_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            degraded_error_rate: config.degraded_error_rate,
            unhealthy_error_rate: config.unhealthy_error_rate,
            degraded_heartbeat_ms: config.degraded_heartbeat_secs * 1000,
            unhealthy_heartbeat_ms: config.unhealthy_heartbeat_secs * 1000,
        }
    }
}

/// Errors per processed message; 0 when nothing was processed.
#[must_use]
pub fn error_rate(message_count: u64, error_count: u64) -> f64 {
    if message_count == 0 {
        0.0
    } else {
        error_count as f64 / message_count as f64
    }
}

/// Classify health. Most severe matching condition wins.
#[must_use]
pub fn evaluate(
    message_count: u64,
    error_count: u64,
    heartbeat_age_ms: u64,
    thresholds: &HealthThresholds,
) -> HealthState {
    let rate = error_rate(message_count, error_count);
    if rate > thresholds.unhealthy_error_rate
        || heartbeat_age_ms > thresholds.unhealthy_heartbeat_ms
    {
        HealthState::Unhealthy
    } else if rate > thresholds.degraded_error_rate
        || heartbeat_age_ms > thresholds.degraded_heartbeat_ms
    {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Snapshot of the health record, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    pub last_heartbeat: u64,
    pub error_count: u64,
    pub message_count: u64,
    /// Start timestamp (epoch ms)
    pub uptime: u64,
    /// Live tracked-tab count at the last check
    pub active_connections: usize,
    /// Number of `initialize` handshakes seen; informational only
    pub connection_events: u64,
}

#[derive(Debug)]
struct Counters {
    status: HealthState,
    last_heartbeat: u64,
    error_count: u64,
    message_count: u64,
    active_connections: usize,
    connection_events: u64,
}

/// Millisecond clock the monitor reads heartbeat ages against.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Process-wide health record for one dispatcher.
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    started_at: u64,
    clock: Clock,
    counters: Mutex<Counters>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("thresholds", &self.thresholds)
            .field("started_at", &self.started_at)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self::starting_at(thresholds, epoch_ms())
    }

    /// Wall-clock monitor whose record starts at `now` (epoch ms).
    pub fn starting_at(thresholds: HealthThresholds, now: u64) -> Self {
        Self::build(thresholds, now, Arc::new(epoch_ms))
    }

    /// Monitor driven by `clock`; the record starts at its current reading.
    pub fn with_clock(thresholds: HealthThresholds, clock: Clock) -> Self {
        let now = clock();
        Self::build(thresholds, now, clock)
    }

    fn build(thresholds: HealthThresholds, now: u64, clock: Clock) -> Self {
        Self {
            thresholds,
            started_at: now,
            clock,
            counters: Mutex::new(Counters {
                status: HealthState::Healthy,
                last_heartbeat: now,
                error_count: 0,
                message_count: 0,
                active_connections: 0,
                connection_events: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Current reading of the monitor's clock.
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Count one processed message.
    pub fn record_message(&self, success: bool) {
        let mut c = self.lock();
        c.message_count += 1;
        if !success {
            c.error_count += 1;
        }
    }

    /// Count one `initialize` handshake.
    pub fn record_connection(&self) -> u64 {
        let mut c = self.lock();
        c.connection_events += 1;
        c.connection_events
    }

    /// Refresh the heartbeat.
    pub fn heartbeat(&self, now: u64) {
        self.lock().last_heartbeat = now;
    }

    /// Recompute status against `now` and store it with the live connection count.
    pub fn check(&self, now: u64, active_connections: usize) -> HealthStatus {
        let mut c = self.lock();
        let age = now.saturating_sub(c.last_heartbeat);
        c.status = evaluate(c.message_count, c.error_count, age, &self.thresholds);
        c.active_connections = active_connections;
        self.status_of(&c)
    }

    /// The last computed record, without recomputing.
    pub fn snapshot(&self) -> HealthStatus {
        let c = self.lock();
        self.status_of(&c)
    }

    fn status_of(&self, c: &Counters) -> HealthStatus {
        HealthStatus {
            status: c.status,
            last_heartbeat: c.last_heartbeat,
            error_count: c.error_count,
            message_count: c.message_count,
            uptime: self.started_at,
            active_connections: c.active_connections,
            connection_events: c.connection_events,
        }
    }

    #[cfg(test)]
    fn set_counts(&self, message_count: u64, error_count: u64) {
        let mut c = self.lock();
        c.message_count = message_count;
        c.error_count = error_count;
    }
}

// =============================================================================
// Ticker
// =============================================================================

/// Handle to a periodic background task (health ticker, queue drainer).
pub struct TickerHandle {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl TickerHandle {
    pub(crate) fn new(task: JoinHandle<()>, shutdown: Arc<AtomicBool>, wake: Arc<Notify>) -> Self {
        Self {
            task,
            shutdown,
            wake,
        }
    }

    /// Signal the ticker to stop.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Wait for the ticker task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawn the periodic health task.
///
/// Every `check_interval` it recomputes status with the count from
/// `connections`; every `log_interval` it logs a summary. Heartbeats only
/// come from the popup, so a silent popup ages into degraded and unhealthy.
#[must_use]
pub fn spawn_health_ticker<F>(
    monitor: Arc<HealthMonitor>,
    connections: F,
    config: &HealthConfig,
    shutdown_flag: Arc<AtomicBool>,
) -> TickerHandle
where
    F: Fn() -> usize + Send + Sync + 'static,
{
    let internal_shutdown = Arc::new(AtomicBool::new(false));
    let internal_flag = Arc::clone(&internal_shutdown);
    let wake = Arc::new(Notify::new());
    let woken = Arc::clone(&wake);
    let check_interval = config.check_interval();
    let log_interval = config.log_interval();

    let task = tokio::spawn(async move {
        let mut check = tokio::time::interval(check_interval);
        let mut summary = tokio::time::interval(log_interval);
        // Both intervals fire immediately; skip the startup summary.
        summary.tick().await;

        loop {
            tokio::select! {
                _ = check.tick() => {
                    if shutdown_flag.load(Ordering::SeqCst) || internal_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let status = monitor.check(monitor.now(), connections());
                    match status.status {
                        HealthState::Healthy => {
                            debug!(active_connections = status.active_connections, "Health check passed");
                        }
                        state => warn!(
                            status = %state,
                            error_count = status.error_count,
                            message_count = status.message_count,
                            "Dispatcher health is {state}"
                        ),
                    }
                }
                _ = summary.tick() => {
                    let status = monitor.snapshot();
                    info!(
                        status = %status.status,
                        message_count = status.message_count,
                        error_count = status.error_count,
                        active_connections = status.active_connections,
                        uptime_ms = monitor.now().saturating_sub(status.uptime),
                        "Health summary"
                    );
                }
                () = woken.notified() => {}
            }

            if shutdown_flag.load(Ordering::SeqCst) || internal_flag.load(Ordering::SeqCst) {
                break;
            }
        }
        info!("Health ticker: shutdown signal received");
    });

    TickerHandle::new(task, internal_shutdown, wake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn error_rate_over_ten_percent_is_unhealthy() {
        let t = HealthThresholds::default();
        assert_eq!(evaluate(100, 11, 0, &t), HealthState::Unhealthy);
        assert_eq!(evaluate(100, 6, 0, &t), HealthState::Degraded);
        assert_eq!(evaluate(100, 5, 0, &t), HealthState::Healthy);
        assert_eq!(evaluate(100, 10, 0, &t), HealthState::Degraded);
    }

    #[test]
    fn stale_heartbeat_degrades() {
        let t = HealthThresholds::default();
        assert_eq!(evaluate(0, 0, 30_000, &t), HealthState::Healthy);
        assert_eq!(evaluate(0, 0, 30_001, &t), HealthState::Degraded);
        assert_eq!(evaluate(0, 0, 60_001, &t), HealthState::Unhealthy);
    }

    #[test]
    fn no_messages_is_zero_rate() {
        assert!(error_rate(0, 0).abs() < f64::EPSILON);
        assert!((error_rate(4, 1) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn monitor_check_uses_counts_and_connections() {
        let monitor = HealthMonitor::starting_at(HealthThresholds::default(), 1_000);
        monitor.set_counts(100, 11);
        let status = monitor.check(1_000, 3);
        assert_eq!(status.status, HealthState::Unhealthy);
        assert_eq!(status.active_connections, 3);
        assert_eq!(status.uptime, 1_000);

        monitor.set_counts(100, 6);
        assert_eq!(monitor.check(1_000, 3).status, HealthState::Degraded);
        assert_eq!(monitor.snapshot().status, HealthState::Degraded);
    }

    #[test]
    fn heartbeat_resets_staleness() {
        let monitor = HealthMonitor::starting_at(HealthThresholds::default(), 0);
        assert_eq!(monitor.check(61_000, 0).status, HealthState::Unhealthy);
        monitor.heartbeat(61_000);
        assert_eq!(monitor.check(61_000, 0).status, HealthState::Healthy);
    }

    #[test]
    fn record_message_counts_failures() {
        let monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.record_message(true);
        monitor.record_message(false);
        let s = monitor.snapshot();
        assert_eq!((s.message_count, s.error_count), (2, 1));
        assert_eq!(monitor.record_connection(), 1);
    }

    #[test]
    fn status_serializes_camel_case() {
        let monitor = HealthMonitor::starting_at(HealthThresholds::default(), 5);
        let json = serde_json::to_value(monitor.snapshot()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["lastHeartbeat"], 5);
        assert!(json.get("activeConnections").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_refreshes_connections_and_stops() {
        let monitor = Arc::new(HealthMonitor::new(HealthThresholds::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let config = HealthConfig {
            check_interval_secs: 1,
            ..HealthConfig::default()
        };

        let handle = spawn_health_ticker(
            Arc::clone(&monitor),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                4
            },
            &config,
            Arc::new(AtomicBool::new(false)),
        );

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        handle.signal_shutdown();
        handle.join().await;

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(monitor.snapshot().active_connections, 4);
    }

    /// Clock over tokio's paused time, starting at 0.
    fn paused_clock() -> Clock {
        let origin = tokio::time::Instant::now();
        Arc::new(move || u64::try_from(origin.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_lets_a_silent_popup_go_stale() {
        let monitor = Arc::new(HealthMonitor::with_clock(HealthThresholds::default(), paused_clock()));
        let config = HealthConfig {
            check_interval_secs: 1,
            ..HealthConfig::default()
        };
        let handle = spawn_health_ticker(Arc::clone(&monitor), || 0, &config, Arc::new(AtomicBool::new(false)));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(monitor.snapshot().status, HealthState::Healthy);
        assert_eq!(monitor.snapshot().last_heartbeat, 0);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(monitor.snapshot().status, HealthState::Degraded);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = monitor.snapshot();
        assert_eq!(status.status, HealthState::Unhealthy);
        assert_eq!(status.last_heartbeat, 0);

        monitor.heartbeat(monitor.now());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.snapshot().status, HealthState::Healthy);

        handle.signal_shutdown();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn external_flag_stops_ticker() {
        let monitor = Arc::new(HealthMonitor::new(HealthThresholds::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = HealthConfig {
            check_interval_secs: 1,
            ..HealthConfig::default()
        };
        let handle = spawn_health_ticker(monitor, || 0, &config, Arc::clone(&shutdown));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        shutdown.store(true, Ordering::SeqCst);
        handle.join().await;
    }
}
