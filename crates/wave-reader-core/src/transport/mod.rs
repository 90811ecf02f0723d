//! Background to content-script delivery.
//!
//! The browser API is reached only through the [`TabTransport`] capability
//! trait. [`ContentScriptLink`] layers the delivery policy on top:
//!
//! ```text
//! resolve tab ──► restricted URL? ──► TabAccess error (no injection)
//!      │
//!      ▼
//! send ──ok──► done
//!   │
//!   └─err──► receiver missing? ──no──► propagate unchanged
//!                  │
//!                  yes
//!                  ▼
//!        inject receiver + optional scripts (best effort)
//!                  ▼
//!            wait injection_delay
//!                  ▼
//!        send once more ──err──► ContentScriptNotReady
//! ```
//!
//! This is a one-shot heal, never an open-ended retry.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};

/// Browser tab identifier.
pub type TabId = u32;

/// What the browser reports about a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    #[serde(default)]
    pub title: String,
}

impl TabInfo {
    pub fn new(id: TabId, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            title: title.into(),
        }
    }
}

/// Browser capabilities the core needs.
///
/// Errors are the browser's own error strings (what `lastError.message`
/// would hold); classification happens in [`ContentScriptLink`].
#[async_trait]
pub trait TabTransport: Send + Sync {
    /// Resolve a tab by id.
    async fn get_tab(&self, tab_id: TabId) -> Option<TabInfo>;

    /// The focused tab of the current window.
    async fn query_active_tab(&self) -> Option<TabInfo>;

    /// Send a message to the tab's content script and await its reply.
    async fn send_to_tab(&self, tab_id: TabId, message: &Value) -> std::result::Result<Value, String>;

    /// Inject a script file into the tab.
    async fn inject_script(&self, tab_id: TabId, script: &str) -> std::result::Result<(), String>;

    /// Broadcast to extension pages (the popup).
    async fn send_to_extension(&self, message: &Value) -> std::result::Result<(), String>;
}

/// True when the error means no content script is listening in the tab.
pub fn is_receiver_missing(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("receiving end does not exist")
        || lower.contains("could not establish connection")
}

/// Delivery policy over a [`TabTransport`].
#[derive(Clone)]
pub struct ContentScriptLink {
    transport: Arc<dyn TabTransport>,
    config: TransportConfig,
}

impl std::fmt::Debug for ContentScriptLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentScriptLink")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContentScriptLink {
    pub fn new(transport: Arc<dyn TabTransport>, config: TransportConfig) -> Self {
        Self { transport, config }
    }

    /// The underlying capability.
    pub fn transport(&self) -> &Arc<dyn TabTransport> {
        &self.transport
    }

    /// True for URLs that can never host a content script.
    pub fn is_restricted_url(&self, url: &str) -> bool {
        self.config
            .restricted_prefixes
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    /// Fail with a tab-access error when `tab` cannot host a content script.
    pub fn check_accessible(&self, tab: TabInfo) -> Result<TabInfo> {
        if self.is_restricted_url(&tab.url) {
            return Err(TransportError::RestrictedUrl {
                tab_id: tab.id,
                url: tab.url,
            }
            .into());
        }
        Ok(tab)
    }

    /// Look up a tab by id, or the focused tab when no id is given.
    ///
    /// Does not check the URL; use [`Self::check_accessible`] for that.
    pub async fn locate(&self, tab_id: Option<TabId>) -> Result<TabInfo> {
        match tab_id {
            Some(id) => Ok(self
                .transport
                .get_tab(id)
                .await
                .ok_or(TransportError::TabNotFound(id))?),
            None => Ok(self
                .transport
                .query_active_tab()
                .await
                .ok_or(TransportError::NoActiveTab)?),
        }
    }

    /// Resolve a tab and make sure a content script could run in it.
    pub async fn resolve_tab(&self, tab_id: TabId) -> Result<TabInfo> {
        let tab = self.locate(Some(tab_id)).await?;
        self.check_accessible(tab)
    }

    /// Resolve the focused tab and make sure a content script could run in it.
    pub async fn active_tab(&self) -> Result<TabInfo> {
        let tab = self.locate(None).await?;
        self.check_accessible(tab)
    }

    /// One-way command to a tab's content script.
    pub async fn deliver(&self, tab_id: TabId, message: &Value) -> Result<()> {
        self.request(tab_id, message).await.map(|_| ())
    }

    /// Command to a tab's content script, returning its reply.
    pub async fn request(&self, tab_id: TabId, message: &Value) -> Result<Value> {
        let tab = self.resolve_tab(tab_id).await?;

        let first_error = match self.transport.send_to_tab(tab.id, message).await {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        if !is_receiver_missing(&first_error) {
            return Err(TransportError::Delivery {
                tab_id: tab.id,
                message: first_error,
            }
            .into());
        }

        info!(
            tab_id = tab.id,
            error = %first_error,
            "Content script not loaded; injecting receiver"
        );
        let injection = self.inject_receivers(tab.id).await;
        tokio::time::sleep(self.config.injection_delay()).await;

        match self.transport.send_to_tab(tab.id, message).await {
            Ok(reply) => {
                debug!(tab_id = tab.id, "Delivery succeeded after injection");
                Ok(reply)
            }
            Err(e) => {
                warn!(tab_id = tab.id, error = %e, "Content script still not ready after injection");
                let message = match injection {
                    Some(failure) => format!("{e} ({failure})"),
                    None => e,
                };
                Err(TransportError::ContentScriptNotReady {
                    tab_id: tab.id,
                    message,
                }
                .into())
            }
        }
    }

    /// Inject the receiver and any optional scripts. Never fails; the
    /// retry that follows decides the outcome. A failed receiver injection
    /// is handed back so a failed retry can report it.
    async fn inject_receivers(&self, tab_id: TabId) -> Option<TransportError> {
        let receiver = &self.config.receiver_script;
        let failure = match self.transport.inject_script(tab_id, receiver).await {
            Ok(()) => None,
            Err(e) => {
                warn!(tab_id, script = %receiver, error = %e, "Receiver injection failed");
                Some(TransportError::Injection {
                    tab_id,
                    script: receiver.clone(),
                    message: e,
                })
            }
        };
        for script in &self.config.optional_scripts {
            if let Err(e) = self.transport.inject_script(tab_id, script).await {
                debug!(tab_id, script = %script, error = %e, "Optional script injection skipped");
            }
        }
        failure
    }

    /// Fire-and-forget broadcast to the popup.
    pub async fn broadcast_to_extension(&self, message: &Value) -> Result<()> {
        self.transport
            .send_to_extension(message)
            .await
            .map_err(|e| TransportError::Broadcast(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryTransport, TransportCall};
    use super::*;
    use serde_json::json;

    fn link(browser: &Arc<MemoryTransport>) -> ContentScriptLink {
        let transport: Arc<dyn TabTransport> = browser.clone();
        ContentScriptLink::new(transport, TransportConfig::default())
    }

    #[test]
    fn receiver_missing_signatures() {
        assert!(is_receiver_missing(
            "Could not establish connection. Receiving end does not exist."
        ));
        assert!(is_receiver_missing("receiving end does not exist"));
        assert!(!is_receiver_missing("The message port closed before a response was received."));
    }

    #[test]
    fn restricted_prefixes() {
        let browser = Arc::new(MemoryTransport::new());
        let link = link(&browser);
        for url in [
            "chrome://extensions",
            "chrome-extension://abc/popup.html",
            "moz-extension://abc",
            "edge://settings",
            "about:blank",
        ] {
            assert!(link.is_restricted_url(url), "{url}");
        }
        assert!(!link.is_restricted_url("https://example.com/chrome://"));
    }

    #[tokio::test(start_paused = true)]
    async fn direct_delivery_needs_no_injection() {
        let browser = Arc::new(MemoryTransport::new());
        browser.add_tab(TabInfo::new(1, "https://example.com", "Example"), true);
        let link = link(&browser);

        link.deliver(1, &json!({"name": "start", "from": "background"}))
            .await
            .unwrap();
        assert!(browser.injections().is_empty());
        assert_eq!(browser.tab_inbox(1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_receiver_is_injected_then_retried_once() {
        let browser = Arc::new(MemoryTransport::new());
        browser.add_tab(TabInfo::new(2, "https://example.com", "Example"), false);
        let link = link(&browser);

        link.deliver(2, &json!({"name": "start", "from": "background"}))
            .await
            .unwrap();
        assert_eq!(
            browser.injections(),
            vec![(2, "content.js".to_string()), (2, "wave-styles.js".to_string())]
        );
        let sends = browser
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Send { .. }))
            .count();
        assert_eq!(sends, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_injection_surfaces_not_ready() {
        let browser = Arc::new(MemoryTransport::new());
        browser.add_tab(TabInfo::new(3, "https://example.com", "Example"), false);
        browser.set_injectable(3, false);
        let link = link(&browser);

        let err = link
            .deliver(3, &json!({"name": "stop", "from": "background"}))
            .await
            .unwrap_err();
        assert!(err.is_content_script_not_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn optional_script_failure_is_not_fatal() {
        let browser = Arc::new(MemoryTransport::new());
        browser.add_tab(TabInfo::new(4, "https://example.com", "Example"), false);
        browser.fail_injection("wave-styles.js");
        let link = link(&browser);

        link.deliver(4, &json!({"name": "start", "from": "background"}))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_propagate_without_injection() {
        let browser = Arc::new(MemoryTransport::new());
        browser.add_tab(TabInfo::new(5, "https://example.com", "Example"), true);
        browser.fail_sends(5, "The message port closed before a response was received.");
        let link = link(&browser);

        let err = link
            .deliver(5, &json!({"name": "start", "from": "background"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("message port closed"));
        assert!(!err.is_content_script_not_ready());
        assert!(browser.injections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restricted_tab_fails_before_sending() {
        let browser = Arc::new(MemoryTransport::new());
        browser.add_tab(TabInfo::new(6, "chrome://newtab", "New Tab"), false);
        let link = link(&browser);

        let err = link
            .deliver(6, &json!({"name": "start", "from": "background"}))
            .await
            .unwrap_err();
        assert!(err.is_tab_access());
        assert!(browser.injections().is_empty());
        assert!(browser.tab_inbox(6).is_empty());
    }

    #[tokio::test]
    async fn locate_falls_back_to_active_tab() {
        let browser = Arc::new(MemoryTransport::new());
        let link = link(&browser);
        let err = link.locate(None).await.unwrap_err();
        assert!(err.is_tab_access());

        browser.add_tab(TabInfo::new(7, "about:blank", "Blank"), false);
        assert_eq!(link.locate(None).await.unwrap().id, 7);
        assert!(link.active_tab().await.unwrap_err().is_tab_access());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tab_is_tab_access_error() {
        let browser = Arc::new(MemoryTransport::new());
        let link = link(&browser);
        let err = link.resolve_tab(99).await.unwrap_err();
        assert!(err.is_tab_access());
        assert!(err.to_string().contains("99"));
    }
}
