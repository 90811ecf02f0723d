//! Background dispatcher: the single inbound funnel of the background context.
//!
//! Every message from the popup or a content script goes through
//! [`Dispatcher::dispatch`]:
//!
//! 1. normalize (unwrap nested envelopes, legacy `type`, infer `from`)
//! 2. build the typed [`Message`]
//! 3. look the lower-cased name up in the handler table
//! 4. run the handler behind the error boundary
//! 5. count the outcome and append to the bounded history
//!
//! Handlers never let an error escape: any `Err` becomes
//! `{success: false, error}`. Unknown names get `"Unknown message type"`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info, warn};

use crate::collaborators::{AnalyticsEvent, BACKEND_TOGGLE, BackendProxy, Collaborators, DisabledBackend};
use crate::config::{Config, DispatcherConfig, HealthConfig};
use crate::diagnostics::LoopReport;
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, HealthStatus, HealthThresholds, TickerHandle, spawn_health_ticker};
use crate::history::BoundedHistory;
use crate::message::{
    Attributes, Message, MessageBody, MessageFactory, MessageSender, epoch_ms, names, normalize,
};
use crate::session::Session;
use crate::tabs::{TabRegistry, TabState};
use crate::transport::{ContentScriptLink, TabId, TabInfo, TabTransport};

/// Error text for names with no handler.
pub const UNKNOWN_MESSAGE_TYPE: &str = "Unknown message type";

/// Origin stamped on commands the background sends to other contexts.
const BACKGROUND: &str = "background";

// =============================================================================
// Response
// =============================================================================

/// Handler response. Serializes flat: `{success, error?, ...data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Attributes,
}

impl Response {
    /// Successful response. Object fields become response fields; any other
    /// non-null value is placed under `data`.
    pub fn ok(data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Attributes::new(),
            other => {
                let mut map = Attributes::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            success: true,
            error: None,
            data,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: Attributes::new(),
        }
    }

    pub fn unknown() -> Self {
        Self::failure(UNKNOWN_MESSAGE_TYPE)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"success": self.success}))
    }
}

/// One processed inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub name: String,
    pub from: String,
    pub processed_at: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: Value,
}

/// A normalized message together with who sent it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: Message,
    pub sender: MessageSender,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;
type Handler = for<'a> fn(&'a Dispatcher, &'a Inbound) -> HandlerFuture<'a>;

fn handler_table() -> HashMap<&'static str, Handler> {
    let entries: [(&'static str, Handler); 19] = [
        (names::INITIALIZE, |d, m| Box::pin(d.initialize(m))),
        (names::PING, |d, m| Box::pin(d.ping(m))),
        (names::HEALTH_CHECK, |d, m| Box::pin(d.health_check(m))),
        (names::START, |d, m| Box::pin(d.start(m))),
        (names::STOP, |d, m| Box::pin(d.stop(m))),
        (names::TOGGLE, |d, m| Box::pin(d.toggle(m))),
        (names::SELECTION_MADE, |d, m| Box::pin(d.selection_made(m))),
        (names::START_SELECTION, |d, m| Box::pin(d.start_selection(m))),
        (names::UPDATE_SETTINGS, |d, m| Box::pin(d.update_settings(m))),
        (names::GET_TAB_STATE, |d, m| Box::pin(d.get_tab_state(m))),
        (names::MESSAGE_HISTORY, |d, m| Box::pin(d.message_history(m))),
        (names::ML_RECOMMENDATION_REQUEST, |d, m| Box::pin(d.ml_recommendation(m))),
        (names::SETTINGS_RESET_REQUEST, |d, m| Box::pin(d.settings_reset(m))),
        (names::ANALYTICS_EVENT, |d, m| Box::pin(d.analytics_event(m))),
        (names::EXTENSION_STATUS_REQUEST, |d, m| Box::pin(d.extension_status(m))),
        (names::BACKEND_REQUEST, |d, m| Box::pin(d.backend_request(m))),
        (names::GRAPHQL_REQUEST, |d, m| Box::pin(d.graphql_request(m))),
        (names::SET_BACKEND_TOGGLE, |d, m| Box::pin(d.set_backend_toggle(m))),
        (names::LOOP_DETECTION_STATS, |d, m| Box::pin(d.loop_detection_stats(m))),
    ];
    entries.into_iter().collect()
}

fn body_mismatch(name: &str) -> Error {
    Error::Runtime(format!("{name} handler received a different message body"))
}

/// Command sent from the background to another context.
fn command(name: &str, attributes: Attributes) -> Value {
    MessageFactory::create_message(name, BACKGROUND, attributes).to_value()
}

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

/// Fields of `authoritative` that differ from (or are missing in) `current`.
pub fn diff_state(authoritative: &Attributes, current: &Attributes) -> Attributes {
    authoritative
        .iter()
        .filter(|(key, _)| key.as_str() != "success" && key.as_str() != "error")
        .filter(|(key, value)| current.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn tab_response(state: &TabState) -> Response {
    Response::ok(json!({
        "tabId": state.tab_id(),
        "going": state.going(),
        "state": state.state(),
    }))
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Owns session, tab, health and history state for one background context.
pub struct Dispatcher {
    config: DispatcherConfig,
    link: ContentScriptLink,
    collaborators: Collaborators,
    session: Session,
    health: Arc<HealthMonitor>,
    health_config: HealthConfig,
    tabs: Mutex<TabRegistry>,
    history: Mutex<BoundedHistory<HistoryEntry>>,
    handlers: HashMap<&'static str, Handler>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("session", &self.session)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// A zero `dispatcher.history_capacity` is treated as 1.
    pub fn new(transport: Arc<dyn TabTransport>, config: &Config, collaborators: Collaborators) -> Self {
        let session = Session::new();
        info!(session_id = %session.id(), "Dispatcher session started");
        Self {
            config: config.dispatcher.clone(),
            link: ContentScriptLink::new(transport, config.transport.clone()),
            collaborators,
            health: Arc::new(HealthMonitor::starting_at(
                HealthThresholds::from(&config.health),
                session.start_time(),
            )),
            session,
            health_config: config.health.clone(),
            tabs: Mutex::new(TabRegistry::new()),
            history: Mutex::new(BoundedHistory::new(config.dispatcher.history_capacity.max(1))),
            handlers: handler_table(),
        }
    }

    /// Dispatcher with default config and collaborators.
    pub fn with_defaults(transport: Arc<dyn TabTransport>) -> Self {
        Self::new(transport, &Config::default(), Collaborators::default())
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Names with a registered handler, sorted.
    pub fn operations(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn tabs(&self) -> MutexGuard<'_, TabRegistry> {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, BoundedHistory<HistoryEntry>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_tab<R>(&self, tab: &TabInfo, f: impl FnOnce(&mut TabState) -> R) -> R {
        let mut tabs = self.tabs();
        f(tabs.entry(tab, epoch_ms()))
    }

    /// Tracked state of one tab.
    pub fn tab_state(&self, tab_id: TabId) -> Option<TabState> {
        self.tabs().get(tab_id).cloned()
    }

    /// Live tracked-tab count; the authoritative `activeConnections`.
    pub fn tab_count(&self) -> usize {
        self.tabs().len()
    }

    /// Recompute health now.
    pub fn check_health(&self) -> HealthStatus {
        self.health.check(self.health.now(), self.tab_count())
    }

    /// Most recent `n` processed messages, oldest first.
    pub fn recent_history(&self, n: usize) -> Vec<HistoryEntry> {
        self.history().recent(n).cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Tab lifecycle
    // -------------------------------------------------------------------------

    /// Navigation completed in a tab.
    pub fn on_tab_updated(&self, tab: &TabInfo) {
        let mut tabs = self.tabs();
        let state = tabs.navigated(tab, epoch_ms());
        debug!(tab_id = state.tab_id(), url = %state.url(), "Tab navigated");
    }

    /// A tab closed.
    pub fn on_tab_removed(&self, tab_id: TabId) {
        if self.tabs().remove(tab_id).is_some() {
            debug!(tab_id, "Tab state removed");
        }
    }

    /// Start the periodic health recompute and summary log.
    #[must_use]
    pub fn spawn_health_ticker(self: &Arc<Self>, shutdown_flag: Arc<AtomicBool>) -> TickerHandle {
        let dispatcher = Arc::clone(self);
        spawn_health_ticker(
            Arc::clone(&self.health),
            move || dispatcher.tab_count(),
            &self.health_config,
            shutdown_flag,
        )
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Handle one inbound message. Never fails.
    pub async fn dispatch(&self, raw: Value, sender: &MessageSender) -> Response {
        let message = MessageFactory::from_attributes(normalize(raw, sender));
        let span = crate::message_span!(
            "dispatch",
            message_name = message.name.as_str(),
            sender = message.from.as_str(),
            session_id = self.session.id(),
        );
        let inbound = Inbound {
            message,
            sender: sender.clone(),
        };
        self.handle(inbound).instrument(span).await
    }

    async fn handle(&self, inbound: Inbound) -> Response {
        let name = inbound.message.name.clone();
        let handler = self.handlers.get(name.as_str()).copied();

        let response = match handler {
            None => {
                debug!(message_name = %name, "Unknown message type");
                Response::unknown()
            }
            Some(handler) => match handler(self, &inbound).await {
                Ok(response) => response,
                Err(e) => {
                    if matches!(e, Error::Validation(_)) {
                        warn!(operation = %name, error = %e, "Rejected invalid request");
                    } else {
                        error!(
                            operation = %name,
                            error = %e,
                            remediation = %e.remediation().map(|r| r.summary).unwrap_or_default(),
                            "Handler failed"
                        );
                    }
                    Response::failure(e.to_string())
                }
            },
        };

        // Unknown names are an expected path, not an error.
        self.health
            .record_message(response.success || handler.is_none());
        self.history().push(HistoryEntry {
            name,
            from: inbound.message.from.clone(),
            processed_at: epoch_ms(),
            success: response.success,
            error: response.error.clone(),
            message: inbound.message.to_value(),
        });
        response
    }

    // -------------------------------------------------------------------------
    // Tab resolution
    // -------------------------------------------------------------------------

    /// Explicit id, else the sending tab, else the focused tab.
    async fn target_tab(&self, explicit: Option<TabId>, sender: &MessageSender) -> Result<TabInfo> {
        self.link.locate(explicit.or(sender.tab_id)).await
    }

    async fn accessible_tab(&self, explicit: Option<TabId>, sender: &MessageSender) -> Result<TabInfo> {
        let tab = self.target_tab(explicit, sender).await?;
        self.link.check_accessible(tab)
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    async fn initialize(&self, _inbound: &Inbound) -> Result<Response> {
        let connection_events = self.health.record_connection();
        self.health.heartbeat(self.health.now());
        let health = self.check_health();
        Ok(Response::ok(json!({
            "sessionId": self.session.id(),
            "connectionEvents": connection_events,
            "health": health,
        })))
    }

    async fn ping(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::Ping {
            tab_id,
            current_state,
        } = &inbound.message.body
        else {
            return Err(body_mismatch(names::PING));
        };
        let now = self.health.now();
        self.health.heartbeat(now);

        let tab = self.target_tab(*tab_id, &inbound.sender).await?;
        if self.link.is_restricted_url(&tab.url) {
            debug!(tab_id = tab.id, url = %tab.url, "Ping skipped for restricted tab");
            return Ok(Response::ok(json!({
                "skipped": true,
                "reason": "restricted-url",
                "tabId": tab.id,
                "hasUpdates": false,
            })));
        }

        let reply = attrs(
            self.link
                .request(tab.id, &command(names::PING, Attributes::new()))
                .await?,
        );
        let going = reply.get("going").and_then(Value::as_bool);
        self.update_tab(&tab, |state| {
            state.record_ping(now);
            if let Some(going) = going {
                state.sync_going(going, now);
            }
        });

        let mut updates = diff_state(&reply, current_state);
        let has_updates = !updates.is_empty();
        updates.insert("hasUpdates".to_string(), Value::Bool(has_updates));
        updates.insert("tabId".to_string(), Value::from(tab.id));
        Ok(Response::ok(Value::Object(updates)))
    }

    async fn health_check(&self, _inbound: &Inbound) -> Result<Response> {
        let health = self.check_health();
        let tabs = self.tabs().snapshot();
        Ok(Response::ok(json!({
            "sessionId": self.session.id(),
            "health": health,
            "tabs": tabs,
        })))
    }

    async fn start(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::Start { tab_id, options } = &inbound.message.body else {
            return Err(body_mismatch(names::START));
        };
        let tab = self.accessible_tab(*tab_id, &inbound.sender).await?;

        let mut attributes = Attributes::new();
        attributes.insert("options".to_string(), Value::Object(options.clone()));
        self.link.deliver(tab.id, &command(names::START, attributes)).await?;

        let selector = options.get("selector").and_then(Value::as_str);
        let state = self.update_tab(&tab, |state| {
            let now = epoch_ms();
            state.mark_started(now);
            if let Some(selector) = selector {
                state.set_selector(selector, now);
            }
            state.clone()
        });
        info!(tab_id = tab.id, "Wave started");
        Ok(tab_response(&state))
    }

    async fn stop(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::Stop { tab_id } = &inbound.message.body else {
            return Err(body_mismatch(names::STOP));
        };

        let tab = match self.accessible_tab(*tab_id, &inbound.sender).await {
            Ok(tab) => tab,
            Err(e) if e.is_tab_access() => {
                debug!(error = %e, "Stop on inaccessible tab treated as already stopped");
                if let Some(id) = tab_id.or(inbound.sender.tab_id) {
                    if let Some(state) = self.tabs().get_mut(id) {
                        state.mark_stopped(epoch_ms());
                    }
                }
                return Ok(Response::ok(json!({"going": false, "alreadyStopped": true})));
            }
            Err(e) => return Err(e),
        };

        let already_stopped = match self
            .link
            .deliver(tab.id, &command(names::STOP, Attributes::new()))
            .await
        {
            Ok(()) => false,
            Err(e) if e.is_content_script_not_ready() => {
                debug!(tab_id = tab.id, "Stop with no content script treated as already stopped");
                true
            }
            Err(e) => return Err(e),
        };

        let state = self.update_tab(&tab, |state| {
            state.mark_stopped(epoch_ms());
            state.clone()
        });
        let mut response = tab_response(&state);
        if already_stopped {
            response
                .data
                .insert("alreadyStopped".to_string(), Value::Bool(true));
        }
        Ok(response)
    }

    async fn toggle(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::Toggle { tab_id, options } = &inbound.message.body else {
            return Err(body_mismatch(names::TOGGLE));
        };
        let tab = self.accessible_tab(*tab_id, &inbound.sender).await?;

        let mut attributes = Attributes::new();
        attributes.insert("options".to_string(), Value::Object(options.clone()));
        let reply = self
            .link
            .request(tab.id, &command(names::TOGGLE, attributes))
            .await?;
        let reported = reply.get("going").and_then(Value::as_bool);

        let state = self.update_tab(&tab, |state| {
            let now = epoch_ms();
            match reported {
                Some(going) => state.sync_going(going, now),
                None => {
                    state.toggle(now);
                }
            }
            state.clone()
        });
        Ok(tab_response(&state))
    }

    async fn selection_made(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::SelectionMade { selector } = &inbound.message.body else {
            return Err(body_mismatch(names::SELECTION_MADE));
        };
        let tab_id = inbound.message.tab_id().or(inbound.sender.tab_id);

        if let (Some(tab_id), Some(selector)) = (tab_id, selector) {
            if let Some(state) = self.tabs().get_mut(tab_id) {
                state.set_selector(selector.clone(), epoch_ms());
            }
        }

        let mut attributes = Attributes::new();
        attributes.insert("selector".to_string(), json!(selector));
        if let Some(tab_id) = tab_id {
            attributes.insert("tabId".to_string(), Value::from(tab_id));
        }
        let forwarded = match self
            .link
            .broadcast_to_extension(&command(names::SELECTION_MADE, attributes))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Could not forward selection to popup");
                false
            }
        };
        Ok(Response::ok(json!({"selector": selector, "forwarded": forwarded})))
    }

    async fn start_selection(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::StartSelection { tab_id } = &inbound.message.body else {
            return Err(body_mismatch(names::START_SELECTION));
        };
        let tab = self.accessible_tab(*tab_id, &inbound.sender).await?;
        self.link
            .deliver(tab.id, &command(names::START_SELECTION, Attributes::new()))
            .await?;
        self.update_tab(&tab, |_| ());
        Ok(Response::ok(json!({"tabId": tab.id, "selecting": true})))
    }

    async fn update_settings(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::UpdateSettings { tab_id, settings } = &inbound.message.body else {
            return Err(body_mismatch(names::UPDATE_SETTINGS));
        };
        let tab = self.accessible_tab(*tab_id, &inbound.sender).await?;

        let mut attributes = Attributes::new();
        attributes.insert("settings".to_string(), Value::Object(settings.clone()));
        self.link
            .deliver(tab.id, &command(names::UPDATE_SETTINGS, attributes))
            .await?;

        let selector = settings.get("selector").and_then(Value::as_str);
        self.update_tab(&tab, |state| {
            if let Some(selector) = selector {
                state.set_selector(selector, epoch_ms());
            }
        });
        Ok(Response::ok(json!({"tabId": tab.id, "updated": true})))
    }

    async fn get_tab_state(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::GetTabState { tab_id } = &inbound.message.body else {
            return Err(body_mismatch(names::GET_TAB_STATE));
        };
        let tab_id = match tab_id.or(inbound.sender.tab_id) {
            Some(id) => id,
            None => self.target_tab(None, &inbound.sender).await?.id,
        };
        let state = self.tab_state(tab_id);
        Ok(Response::ok(json!({
            "tabId": tab_id,
            "tracked": state.is_some(),
            "tabState": state,
        })))
    }

    async fn message_history(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::MessageHistory { limit } = &inbound.message.body else {
            return Err(body_mismatch(names::MESSAGE_HISTORY));
        };
        let limit = limit.unwrap_or(self.config.history_view_limit);
        let history = self.history();
        let entries: Vec<&HistoryEntry> = history.recent(limit).collect();
        Ok(Response::ok(json!({
            "history": entries,
            "returned": entries.len(),
            "total": history.total_pushed(),
        })))
    }

    async fn ml_recommendation(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::MlRecommendationRequest {
            domain,
            path,
            selector,
        } = &inbound.message.body
        else {
            return Err(body_mismatch(names::ML_RECOMMENDATION_REQUEST));
        };
        let recommendations = self
            .collaborators
            .ml
            .get_recommendations(
                domain.as_deref().unwrap_or_default(),
                path.as_deref().unwrap_or("/"),
                selector.as_deref(),
            )
            .await?;
        Ok(Response::ok(json!({"recommendations": recommendations})))
    }

    async fn settings_reset(&self, _inbound: &Inbound) -> Result<Response> {
        let settings = self.collaborators.ml.reset_defaults().await?;
        Ok(Response::ok(json!({"settings": settings})))
    }

    async fn analytics_event(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::AnalyticsEvent { event, data } = &inbound.message.body else {
            return Err(body_mismatch(names::ANALYTICS_EVENT));
        };
        let event = AnalyticsEvent {
            event: event.clone().unwrap_or_else(|| "unnamed".to_string()),
            from: inbound.message.from.clone(),
            data: data.clone(),
            timestamp: inbound.message.timestamp,
        };
        self.collaborators.analytics.record(&event).await?;
        Ok(Response::ok(json!({"recorded": true})))
    }

    async fn extension_status(&self, _inbound: &Inbound) -> Result<Response> {
        let ml = self.collaborators.ml.status().await?;
        let backend_enabled = self.collaborators.toggles.is_enabled(BACKEND_TOGGLE).await?;
        let health = self.health.snapshot();
        Ok(Response::ok(json!({
            "version": crate::VERSION,
            "sessionId": self.session.id(),
            "ml": ml,
            "backendEnabled": backend_enabled,
            "messageCount": health.message_count,
            "errorCount": health.error_count,
            "activeConnections": self.tab_count(),
        })))
    }

    /// The real backend while the toggle is on, the disabled one otherwise.
    async fn backend(&self) -> Result<Arc<dyn BackendProxy>> {
        if self.collaborators.toggles.is_enabled(BACKEND_TOGGLE).await? {
            Ok(Arc::clone(&self.collaborators.backend))
        } else {
            Ok(Arc::new(DisabledBackend))
        }
    }

    async fn backend_request(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::BackendRequest {
            endpoint,
            options,
            payload,
        } = &inbound.message.body
        else {
            return Err(body_mismatch(names::BACKEND_REQUEST));
        };
        let endpoint = endpoint.as_deref().ok_or_else(|| Error::missing("endpoint"))?;
        let response = self.backend().await?.request(endpoint, options, payload).await?;
        Ok(Response::ok(json!({
            "data": response.data,
            "backendDisabled": response.backend_disabled,
        })))
    }

    async fn graphql_request(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::GraphqlRequest {
            endpoint,
            query,
            variables,
        } = &inbound.message.body
        else {
            return Err(body_mismatch(names::GRAPHQL_REQUEST));
        };
        let endpoint = endpoint.as_deref().ok_or_else(|| Error::missing("endpoint"))?;
        let query = query.as_deref().ok_or_else(|| Error::missing("query"))?;
        let response = self
            .backend()
            .await?
            .graphql_request(endpoint, query, variables)
            .await?;
        Ok(Response::ok(json!({
            "data": response.data,
            "errors": response.errors,
            "backendDisabled": response.backend_disabled,
        })))
    }

    async fn set_backend_toggle(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::SetBackendToggle { enabled } = &inbound.message.body else {
            return Err(body_mismatch(names::SET_BACKEND_TOGGLE));
        };
        let enabled = enabled.ok_or_else(|| Error::missing("enabled"))?;
        self.collaborators
            .toggles
            .set_enabled(BACKEND_TOGGLE, enabled)
            .await?;
        info!(enabled, "Backend toggle changed");
        Ok(Response::ok(json!({"enabled": enabled})))
    }

    async fn loop_detection_stats(&self, inbound: &Inbound) -> Result<Response> {
        let MessageBody::LoopDetectionStats { stats } = &inbound.message.body else {
            return Err(body_mismatch(names::LOOP_DETECTION_STATS));
        };
        let report = LoopReport::from_stats(stats);
        report.log(&inbound.message.from);
        Ok(Response::ok(json!({
            "anomalies": report.event_anomalies.len() + report.state_anomalies.len(),
        })))
    }
}
