//! Contracts for the services the dispatcher delegates to.
//!
//! The backend proxy, ML recommendation engine, analytics pipeline and
//! feature-toggle store live outside this crate. The dispatcher only matches
//! request and response shapes against these traits. Each trait ships a
//! conservative default so a dispatcher works with nothing wired in.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::Result;

// =============================================================================
// Backend proxy
// =============================================================================

/// Header (or field) marking a response as served by the disabled backend.
pub const BACKEND_DISABLED_HEADER: &str = "x-backend-disabled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResponse {
    pub data: Value,
    pub backend_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlResponse {
    pub data: Value,
    #[serde(default)]
    pub errors: Vec<Value>,
    pub backend_disabled: bool,
}

#[async_trait]
pub trait BackendProxy: Send + Sync {
    async fn request(&self, endpoint: &str, options: &Value, payload: &Value) -> Result<BackendResponse>;

    async fn graphql_request(
        &self,
        endpoint: &str,
        query: &str,
        variables: &Value,
    ) -> Result<GraphqlResponse>;
}

/// Whether a raw backend response came from the disabled (mock) backend.
///
/// Looks for a `backendDisabled` field first, then for the
/// [`BACKEND_DISABLED_HEADER`] in a `headers` map (bool or `"true"`).
pub fn backend_disabled_from(response: &Value) -> bool {
    if let Some(flag) = response.get("backendDisabled").and_then(Value::as_bool) {
        return flag;
    }
    let Some(Value::Object(headers)) = response.get("headers") else {
        return false;
    };
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(BACKEND_DISABLED_HEADER))
        .is_some_and(|(_, value)| match value {
            Value::Bool(b) => *b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        })
}

/// Answers every request locally, tagged `backendDisabled`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBackend;

#[async_trait]
impl BackendProxy for DisabledBackend {
    async fn request(&self, endpoint: &str, _options: &Value, _payload: &Value) -> Result<BackendResponse> {
        Ok(BackendResponse {
            data: json!({
                "endpoint": endpoint,
                "message": "Backend disabled; no request was sent",
            }),
            backend_disabled: true,
        })
    }

    async fn graphql_request(
        &self,
        endpoint: &str,
        _query: &str,
        _variables: &Value,
    ) -> Result<GraphqlResponse> {
        Ok(GraphqlResponse {
            data: json!({ "endpoint": endpoint }),
            errors: Vec::new(),
            backend_disabled: true,
        })
    }
}

// =============================================================================
// ML recommendations
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub selector: String,
    pub confidence: f64,
    pub reason: String,
    #[serde(default)]
    pub settings: Value,
}

#[async_trait]
pub trait MlService: Send + Sync {
    async fn get_recommendations(
        &self,
        domain: &str,
        path: &str,
        selector: Option<&str>,
    ) -> Result<Vec<Recommendation>>;

    /// Default settings to restore.
    async fn reset_defaults(&self) -> Result<Value>;

    async fn status(&self) -> Result<Value>;
}

/// Settings the extension ships with.
pub fn default_settings() -> Value {
    json!({
        "selector": "p",
        "waveSpeed": 4,
        "axisTranslateAmountXMax": 0,
        "axisTranslateAmountXMin": -1,
        "axisRotationAmountYMax": 2,
        "axisRotationAmountYMin": -2,
        "showNotifications": true,
    })
}

/// Fixed per-domain recommendations with a generic fallback.
#[derive(Debug, Default)]
pub struct StaticMlService {
    by_domain: HashMap<String, Vec<Recommendation>>,
    requests: AtomicU64,
}

impl StaticMlService {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>, recommendations: Vec<Recommendation>) -> Self {
        self.by_domain.insert(domain.into(), recommendations);
        self
    }
}

#[async_trait]
impl MlService for StaticMlService {
    async fn get_recommendations(
        &self,
        domain: &str,
        _path: &str,
        selector: Option<&str>,
    ) -> Result<Vec<Recommendation>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(known) = self.by_domain.get(domain) {
            return Ok(known.clone());
        }
        Ok(vec![Recommendation {
            selector: selector.unwrap_or("p").to_string(),
            confidence: 0.5,
            reason: "default".to_string(),
            settings: default_settings(),
        }])
    }

    async fn reset_defaults(&self) -> Result<Value> {
        Ok(default_settings())
    }

    async fn status(&self) -> Result<Value> {
        Ok(json!({
            "available": true,
            "knownDomains": self.by_domain.len(),
            "requests": self.requests.load(Ordering::Relaxed),
        }))
    }
}

// =============================================================================
// Analytics
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event: String,
    pub from: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(&self, event: &AnalyticsEvent) -> Result<()>;
}

/// Emits each event as a structured log line.
#[derive(Debug, Default)]
pub struct TracingAnalytics {
    recorded: AtomicU64,
}

impl TracingAnalytics {
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AnalyticsSink for TracingAnalytics {
    async fn record(&self, event: &AnalyticsEvent) -> Result<()> {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "wave_reader::analytics",
            event = %event.event,
            from = %event.from,
            timestamp = event.timestamp,
            "Analytics event"
        );
        Ok(())
    }
}

// =============================================================================
// Feature toggles
// =============================================================================

/// Toggle controlling whether backend requests reach the real backend.
pub const BACKEND_TOGGLE: &str = "backend-api";

#[async_trait]
pub trait FeatureToggles: Send + Sync {
    async fn is_enabled(&self, name: &str) -> Result<bool>;
    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()>;
}

/// Toggles held in memory; unknown toggles are off.
#[derive(Debug, Default)]
pub struct InMemoryToggles {
    flags: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl FeatureToggles for InMemoryToggles {
    async fn is_enabled(&self, name: &str) -> Result<bool> {
        let flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        Ok(flags.get(name).copied().unwrap_or(false))
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), enabled);
        Ok(())
    }
}

/// Wraps a toggle source with a last-known-value cache.
///
/// When the source fails, the cached value is used; with nothing cached the
/// toggle reads as off. Reads never fail.
pub struct CachedToggles {
    source: Arc<dyn FeatureToggles>,
    cache: Mutex<HashMap<String, bool>>,
}

impl std::fmt::Debug for CachedToggles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToggles").finish_non_exhaustive()
    }
}

impl CachedToggles {
    pub fn new(source: Arc<dyn FeatureToggles>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, name: &str) -> Option<bool> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    fn remember(&self, name: &str, enabled: bool) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), enabled);
    }
}

impl Default for CachedToggles {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryToggles::default()))
    }
}

#[async_trait]
impl FeatureToggles for CachedToggles {
    async fn is_enabled(&self, name: &str) -> Result<bool> {
        match self.source.is_enabled(name).await {
            Ok(enabled) => {
                self.remember(name, enabled);
                Ok(enabled)
            }
            Err(e) => {
                let fallback = self.cached(name).unwrap_or(false);
                warn!(toggle = name, error = %e, fallback, "Toggle lookup failed; using cached value");
                Ok(fallback)
            }
        }
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.source.set_enabled(name, enabled).await?;
        self.remember(name, enabled);
        Ok(())
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// Everything the dispatcher delegates to.
#[derive(Clone)]
pub struct Collaborators {
    /// The real backend, used while [`BACKEND_TOGGLE`] is on
    pub backend: Arc<dyn BackendProxy>,
    pub ml: Arc<dyn MlService>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub toggles: Arc<dyn FeatureToggles>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            backend: Arc::new(DisabledBackend),
            ml: Arc::new(StaticMlService::new()),
            analytics: Arc::new(TracingAnalytics::default()),
            toggles: Arc::new(CachedToggles::default()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
