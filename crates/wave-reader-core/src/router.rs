//! Priority message router.
//!
//! Component-addressed bus for in-popup coordination. Components register a
//! [`ComponentHandler`] under a name ("go-button", "settings", ...); senders
//! address them explicitly or let [`resolve_route`] pick one from the
//! message type.
//!
//! # Queues
//!
//! Every message lands in one of four FIFO queues before processing.
//! [`MessageRouter::send`] claims its own message straight away;
//! [`MessageRouter::drain_queues`] picks up whatever is left, one message per
//! queue per pass, strictly `critical > high > normal > low`.
//!
//! An id is live while it is queued or in flight, and a live id is processed
//! once: enqueueing it again is ignored, sending it takes over the queued
//! copy, and sending it while in flight fails.
//!
//! # Timeouts
//!
//! | Priority | Timeout |
//! |----------|---------|
//! | critical | 1s      |
//! | high     | 5s      |
//! | normal   | 10s     |
//! | low      | 30s     |
//!
//! Timeouts are advisory: they appear in stats and health, nothing aborts.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::{Error, Result, RouterError};
use crate::health::{HealthState, TickerHandle};
use crate::history::BoundedHistory;
use crate::message::epoch_ms;
use crate::retry::{RetryPolicy, with_retry_outcome};

/// Catch-all component for types no route matches.
pub const MAIN_APP: &str = "main-app";

/// Ordered substring routes; first match wins.
pub const ROUTES: [(&str, &str); 5] = [
    ("WAVE_READER", "wave-reader"),
    ("TAB", "wave-tabs"),
    ("SETTING", "settings"),
    ("SELECTOR", "selector-input"),
    ("BUTTON", "go-button"),
];

/// Success rate (percent) under which the router is unhealthy.
const UNHEALTHY_SUCCESS_RATE: f64 = 80.0;
/// Error count over which the router is degraded.
const DEGRADED_ERROR_COUNT: u64 = 10;
/// Total queued messages over which the router is degraded.
const DEGRADED_QUEUE_DEPTH: usize = 100;

// =============================================================================
// Priority
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Drain order.
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Queue index; 0 drains first.
    #[must_use]
    pub const fn rank(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!(
                "unknown priority: {s}. Expected one of: critical, high, normal, low"
            )),
        }
    }
}

// =============================================================================
// Messages and results
// =============================================================================

/// A message on the router bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterMessage {
    /// Assigned on send when empty
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Assigned on send when 0
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl RouterMessage {
    pub fn new(message_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            message_type: message_type.into(),
            source: source.into(),
            target: None,
            priority: Priority::Normal,
            data: Value::Null,
            timestamp: 0,
            trace_id: None,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRoutingResult {
    pub success: bool,
    pub target_component: String,
    /// Milliseconds spent in the handler
    pub processing_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message_id: String,
    pub timestamp: u64,
    pub retry_count: u32,
}

impl MessageRoutingResult {
    /// `Ok` on success, the routing failure as an error otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(RouterError::HandlerFailed {
                component: self.target_component,
                message: self.error.unwrap_or_default(),
            }
            .into())
        }
    }
}

/// A named component on the bus.
#[async_trait]
pub trait ComponentHandler: Send + Sync {
    async fn handle(&self, message: &RouterMessage) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ComponentHandler for FnHandler<F>
where
    F: Fn(&RouterMessage) -> Result<Value> + Send + Sync,
{
    async fn handle(&self, message: &RouterMessage) -> Result<Value> {
        (self.0)(message)
    }
}

/// Wrap a synchronous closure as a component handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn ComponentHandler>
where
    F: Fn(&RouterMessage) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Route a message type by ordered substring match, falling back to [`MAIN_APP`].
///
/// Matching is case-insensitive: the type is upper-cased first.
#[must_use]
pub fn resolve_route(message_type: &str) -> &'static str {
    let upper = message_type.to_uppercase();
    ROUTES
        .iter()
        .find(|(pattern, _)| upper.contains(pattern))
        .map_or(MAIN_APP, |(_, component)| component)
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    /// Messages processed since construction
    pub total_messages: u64,
    /// Percent of successful outcomes in the rolling history; 100 when empty
    pub success_rate: f64,
    /// Mean handler time (ms) over the per-target samples
    pub average_processing_time: f64,
    /// Failed outcomes in the rolling history
    pub error_count: u64,
    pub queue_sizes: BTreeMap<String, usize>,
    /// Messages sent per priority since construction
    pub priority_distribution: BTreeMap<String, u64>,
}

impl RouterStats {
    pub fn total_queued(&self) -> usize {
        self.queue_sizes.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterHealth {
    pub status: HealthState,
    pub issues: Vec<String>,
    pub stats: RouterStats,
}

/// Derive router health from stats. Unhealthy supersedes degraded.
#[must_use]
pub fn evaluate_health(stats: &RouterStats) -> (HealthState, Vec<String>) {
    if stats.success_rate < UNHEALTHY_SUCCESS_RATE {
        return (
            HealthState::Unhealthy,
            vec![format!("Success rate {:.1}% below {UNHEALTHY_SUCCESS_RATE}%", stats.success_rate)],
        );
    }
    let mut issues = Vec::new();
    if stats.error_count > DEGRADED_ERROR_COUNT {
        issues.push(format!("{} errors in recent history", stats.error_count));
    }
    let queued = stats.total_queued();
    if queued > DEGRADED_QUEUE_DEPTH {
        issues.push(format!("{queued} messages queued"));
    }
    if issues.is_empty() {
        (HealthState::Healthy, issues)
    } else {
        (HealthState::Degraded, issues)
    }
}

/// One processed message, as kept in the rolling history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedEntry {
    pub message_id: String,
    pub message_type: String,
    pub target_component: String,
    pub priority: Priority,
    pub success: bool,
    pub processing_time: f64,
    pub timestamp: u64,
}

// =============================================================================
// Router
// =============================================================================

struct RouterState {
    queues: [VecDeque<RouterMessage>; 4],
    in_flight: HashSet<String>,
    history: BoundedHistory<RoutedEntry>,
    samples: HashMap<String, BoundedHistory<f64>>,
    priority_distribution: [u64; 4],
}

impl RouterState {
    fn push(&mut self, message: RouterMessage) {
        let queue = &mut self.queues[message.priority.rank()];
        let at = queue
            .iter()
            .rposition(|m| m.timestamp <= message.timestamp)
            .map_or(0, |i| i + 1);
        self.priority_distribution[message.priority.rank()] += 1;
        queue.insert(at, message);
    }

    fn is_queued(&self, id: &str) -> bool {
        self.queues.iter().any(|q| q.iter().any(|m| m.id == id))
    }

    /// Mark `message` in flight for immediate processing, taking any queued
    /// copy with the same id out of its queue. False when already in flight.
    fn claim(&mut self, message: &RouterMessage) -> bool {
        if self.in_flight.contains(&message.id) {
            return false;
        }
        let mut was_queued = false;
        for queue in &mut self.queues {
            if let Some(pos) = queue.iter().position(|m| m.id == message.id) {
                queue.remove(pos);
                was_queued = true;
                break;
            }
        }
        if !was_queued {
            self.priority_distribution[message.priority.rank()] += 1;
        }
        self.in_flight.insert(message.id.clone());
        true
    }

    /// Remove the oldest queued message of `priority` that is not in flight.
    fn claim_next(&mut self, priority: Priority) -> Option<RouterMessage> {
        let queue = &mut self.queues[priority.rank()];
        let pos = queue.iter().position(|m| !self.in_flight.contains(&m.id))?;
        let message = queue.remove(pos)?;
        self.in_flight.insert(message.id.clone());
        Some(message)
    }
}

enum Route {
    /// Registered explicit target, else the type route.
    Auto,
    /// Only the named component.
    Exact(String),
}

/// Priority-queued component bus. Construct one per popup and share it.
pub struct MessageRouter {
    config: RouterConfig,
    handlers: RwLock<HashMap<String, Arc<dyn ComponentHandler>>>,
    state: Mutex<RouterState>,
    next_id: AtomicU64,
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("config", &self.config)
            .field("components", &self.components())
            .finish_non_exhaustive()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl MessageRouter {
    /// Zero capacities and a zero drain interval are raised to 1.
    pub fn new(mut config: RouterConfig) -> Self {
        config.history_capacity = config.history_capacity.max(1);
        config.metrics_samples = config.metrics_samples.max(1);
        config.drain_interval_ms = config.drain_interval_ms.max(1);
        let history = BoundedHistory::new(config.history_capacity);
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            state: Mutex::new(RouterState {
                queues: Default::default(),
                in_flight: HashSet::new(),
                history,
                samples: HashMap::new(),
                priority_distribution: [0; 4],
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Components
    // -------------------------------------------------------------------------

    /// Register (or replace) the handler for `component`.
    pub fn register_component(&self, component: impl Into<String>, handler: Arc<dyn ComponentHandler>) {
        let component = component.into();
        debug!(component = %component, "Component registered");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(component, handler);
    }

    /// Returns false when nothing was registered under `component`.
    pub fn unregister_component(&self, component: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(component)
            .is_some()
    }

    /// Registered component names, sorted.
    pub fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn handler(&self, component: &str) -> Option<Arc<dyn ComponentHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(component)
            .cloned()
    }

    /// Advisory processing timeout for `priority`.
    pub fn priority_timeout(&self, priority: Priority) -> Duration {
        self.config.timeouts.for_priority(priority)
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    fn stamp(&self, message: &mut RouterMessage) {
        if message.timestamp == 0 {
            message.timestamp = epoch_ms();
        }
        if message.id.is_empty() {
            let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
            message.id = format!("msg_{}_{seq}", message.timestamp);
        }
    }

    /// Queue a message without processing it; returns its id.
    pub fn enqueue(&self, mut message: RouterMessage) -> String {
        self.stamp(&mut message);
        let id = message.id.clone();
        let mut state = self.lock();
        if state.is_queued(&id) || state.in_flight.contains(&id) {
            debug!(message_id = %id, "Duplicate message id ignored");
            return id;
        }
        debug!(message_id = %id, priority = %message.priority, "Message queued");
        state.push(message);
        id
    }

    /// Queue and immediately process a message.
    pub async fn send(&self, message: RouterMessage) -> MessageRoutingResult {
        self.send_routed(message, Route::Auto).await
    }

    async fn send_routed(&self, mut message: RouterMessage, route: Route) -> MessageRoutingResult {
        self.stamp(&mut message);
        let claimed = self.lock().claim(&message);
        if !claimed {
            let target = self.target_for(&message, &route);
            return MessageRoutingResult {
                success: false,
                target_component: target,
                processing_time: 0.0,
                response: None,
                error: Some(format!("Message {} is already in flight", message.id)),
                message_id: message.id,
                timestamp: epoch_ms(),
                retry_count: message.retry_count,
            };
        }
        self.process(message, route).await
    }

    fn target_for(&self, message: &RouterMessage, route: &Route) -> String {
        match route {
            Route::Exact(component) => component.clone(),
            Route::Auto => match &message.target {
                Some(target) if self.handler(target).is_some() => target.clone(),
                _ => resolve_route(&message.message_type).to_string(),
            },
        }
    }

    /// Run a claimed message through its handler and record the outcome.
    async fn process(&self, message: RouterMessage, route: Route) -> MessageRoutingResult {
        let target = self.target_for(&message, &route);
        let started = Instant::now();
        let outcome = match self.handler(&target) {
            Some(handler) => handler.handle(&message).await,
            None => Err(RouterError::NoHandler(target.clone()).into()),
        };
        let processing_time = started.elapsed().as_secs_f64() * 1000.0;

        let (response, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(Error::Router(RouterError::NoHandler(component))) => {
                (None, Some(format!("No handler registered for component: {component}")))
            }
            Err(e) => (None, Some(e.to_string())),
        };
        let success = error.is_none();
        let finished = epoch_ms();

        {
            let mut state = self.lock();
            state.in_flight.remove(&message.id);
            let samples = self.config.metrics_samples;
            state
                .samples
                .entry(target.clone())
                .or_insert_with(|| BoundedHistory::new(samples))
                .push(processing_time);
            state.history.push(RoutedEntry {
                message_id: message.id.clone(),
                message_type: message.message_type.clone(),
                target_component: target.clone(),
                priority: message.priority,
                success,
                processing_time,
                timestamp: finished,
            });
        }

        match &error {
            None => debug!(
                message_id = %message.id,
                target = %target,
                priority = %message.priority,
                processing_ms = processing_time,
                "Message routed"
            ),
            Some(e) => warn!(
                message_id = %message.id,
                target = %target,
                priority = %message.priority,
                error = %e,
                "Message routing failed"
            ),
        }

        MessageRoutingResult {
            success,
            target_component: target,
            processing_time,
            response,
            error,
            message_id: message.id,
            timestamp: finished,
            retry_count: message.retry_count,
        }
    }

    /// Send up to `max_retries + 1` times with `2^attempt * base` backoff.
    ///
    /// Each attempt is a fresh send with its own id and `retry_count` set to
    /// the attempt number.
    pub async fn send_with_retry(
        &self,
        message: RouterMessage,
        max_retries: u32,
    ) -> Result<MessageRoutingResult> {
        let policy = RetryPolicy::router(
            Duration::from_millis(self.config.retry_base_delay_ms),
            max_retries,
        );
        let outcome = with_retry_outcome(&policy, |attempt| {
            let mut attempt_message = message.clone();
            attempt_message.id.clear();
            attempt_message.retry_count = attempt;
            async move { self.send(attempt_message).await.into_result() }
        })
        .await;

        outcome.result.map_err(|e| {
            let last_error = match e {
                Error::Router(RouterError::HandlerFailed { message, .. }) => message,
                other => other.to_string(),
            };
            RouterError::RetriesExhausted {
                attempts: outcome.attempts,
                last_error,
            }
            .into()
        })
    }

    /// Send a copy to each target in turn; one result per target.
    pub async fn broadcast(&self, message: RouterMessage, targets: &[&str]) -> Vec<MessageRoutingResult> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let mut copy = message.clone();
            copy.id.clear();
            copy.target = Some((*target).to_string());
            results.push(self.send_routed(copy, Route::Exact((*target).to_string())).await);
        }
        let failed = results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            info!(
                message_type = %message.message_type,
                targets = targets.len(),
                failed,
                "Broadcast partially failed"
            );
        }
        results
    }

    /// One drain pass: at most one message per queue, critical first.
    pub async fn drain_queues(&self) -> Vec<MessageRoutingResult> {
        let mut results = Vec::new();
        for priority in Priority::ALL {
            let next = self.lock().claim_next(priority);
            if let Some(message) = next {
                results.push(self.process(message, Route::Auto).await);
            }
        }
        results
    }

    /// Spawn a task that calls [`Self::drain_queues`] every `drain_interval_ms`.
    #[must_use]
    pub fn spawn_queue_drainer(self: &Arc<Self>, shutdown_flag: Arc<AtomicBool>) -> TickerHandle {
        let router = Arc::clone(self);
        let internal_shutdown = Arc::new(AtomicBool::new(false));
        let internal_flag = Arc::clone(&internal_shutdown);
        let wake = Arc::new(Notify::new());
        let woken = Arc::clone(&wake);
        let every = Duration::from_millis(self.config.drain_interval_ms);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = woken.notified() => {}
                }
                if shutdown_flag.load(Ordering::SeqCst) || internal_flag.load(Ordering::SeqCst) {
                    break;
                }
                router.drain_queues().await;
            }
            debug!("Queue drainer stopped");
        });

        TickerHandle::new(task, internal_shutdown, wake)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.lock().queues[priority.rank()].len()
    }

    /// Most recent `n` processed entries, oldest first.
    pub fn recent_history(&self, n: usize) -> Vec<RoutedEntry> {
        self.lock().history.recent(n).cloned().collect()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn get_stats(&self) -> RouterStats {
        let state = self.lock();
        let window = state.history.len();
        let errors = state.history.iter().filter(|e| !e.success).count();
        let success_rate = if window == 0 {
            100.0
        } else {
            (window - errors) as f64 / window as f64 * 100.0
        };

        let (sum, count) = state
            .samples
            .values()
            .flat_map(BoundedHistory::iter)
            .fold((0.0, 0usize), |(sum, count), ms| (sum + ms, count + 1));
        let average_processing_time = if count == 0 { 0.0 } else { sum / count as f64 };

        RouterStats {
            total_messages: state.history.total_pushed(),
            success_rate,
            average_processing_time,
            error_count: errors as u64,
            queue_sizes: Priority::ALL
                .iter()
                .map(|p| (p.to_string(), state.queues[p.rank()].len()))
                .collect(),
            priority_distribution: Priority::ALL
                .iter()
                .map(|p| (p.to_string(), state.priority_distribution[p.rank()]))
                .collect(),
        }
    }

    pub fn health_check(&self) -> RouterHealth {
        let stats = self.get_stats();
        let (status, issues) = evaluate_health(&stats);
        if status != HealthState::Healthy {
            warn!(status = %status, issues = ?issues, "Router health check");
        }
        RouterHealth {
            status,
            issues,
            stats,
        }
    }
}
