//! In-process simulated browser.
//!
//! Backs the CLI and the tests. Each tab carries a simulated content script
//! that either is loaded (answers sends) or is not (sends fail with the
//! browser's "receiving end does not exist" error until the receiver script
//! is injected). Failures can be scripted per tab and every call is logged.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{TabId, TabInfo, TabTransport};
use crate::message::Attributes;

const RECEIVER_MISSING: &str = "Could not establish connection. Receiving end does not exist.";
const CANNOT_INJECT: &str = "Cannot access contents of the page.";

/// One recorded capability call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    GetTab(TabId),
    QueryActiveTab,
    Send { tab_id: TabId, name: String },
    Inject { tab_id: TabId, script: String },
    Extension { name: String },
}

/// State of the simulated content script in a tab.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentState {
    pub going: bool,
    pub selector: Option<String>,
    pub selecting: bool,
    pub settings: Attributes,
}

impl ContentState {
    fn snapshot(&self) -> Value {
        json!({
            "going": self.going,
            "selector": self.selector,
            "selecting": self.selecting,
        })
    }

    /// Apply a command the way the content script would and build its reply.
    fn handle(&mut self, message: &Value) -> Value {
        let name = message
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match name {
            "start" => {
                self.going = true;
                if let Some(selector) = message.pointer("/options/selector").and_then(Value::as_str)
                {
                    self.selector = Some(selector.to_string());
                }
            }
            "stop" => self.going = false,
            "toggle" => self.going = !self.going,
            "start-selection" => self.selecting = true,
            "update-settings" => {
                if let Some(Value::Object(settings)) = message.get("settings") {
                    for (key, value) in settings {
                        self.settings.insert(key.clone(), value.clone());
                    }
                    if let Some(selector) = settings.get("selector").and_then(Value::as_str) {
                        self.selector = Some(selector.to_string());
                    }
                }
            }
            _ => {}
        }
        let mut reply = self.snapshot();
        if let Value::Object(map) = &mut reply {
            map.insert("success".to_string(), Value::Bool(true));
        }
        reply
    }
}

#[derive(Debug)]
struct SimTab {
    info: TabInfo,
    receiver_loaded: bool,
    injectable: bool,
    send_failure: Option<String>,
    content: ContentState,
    inbox: Vec<Value>,
}

#[derive(Debug)]
struct Browser {
    tabs: BTreeMap<TabId, SimTab>,
    active: Option<TabId>,
    popup_open: bool,
    popup_inbox: Vec<Value>,
    failing_scripts: HashSet<String>,
    calls: Vec<TransportCall>,
}

/// Simulated browser implementing [`TabTransport`].
#[derive(Debug)]
pub struct MemoryTransport {
    receiver_script: String,
    inner: Mutex<Browser>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Empty browser with the popup open and `content.js` as the receiver.
    pub fn new() -> Self {
        Self::with_receiver_script("content.js")
    }

    /// Empty browser whose receiver is loaded by injecting `script`.
    pub fn with_receiver_script(script: impl Into<String>) -> Self {
        Self {
            receiver_script: script.into(),
            inner: Mutex::new(Browser {
                tabs: BTreeMap::new(),
                active: None,
                popup_open: true,
                popup_inbox: Vec::new(),
                failing_scripts: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Browser> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a tab. The first tab opened becomes the active one.
    pub fn add_tab(&self, info: TabInfo, receiver_loaded: bool) {
        let mut browser = self.lock();
        let id = info.id;
        browser.tabs.insert(
            id,
            SimTab {
                info,
                receiver_loaded,
                injectable: true,
                send_failure: None,
                content: ContentState::default(),
                inbox: Vec::new(),
            },
        );
        if browser.active.is_none() {
            browser.active = Some(id);
        }
    }

    /// Close a tab.
    pub fn remove_tab(&self, tab_id: TabId) {
        let mut browser = self.lock();
        browser.tabs.remove(&tab_id);
        if browser.active == Some(tab_id) {
            browser.active = None;
        }
    }

    /// Navigate a tab. Navigation unloads the content script.
    pub fn navigate(&self, tab_id: TabId, url: impl Into<String>) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.info.url = url.into();
            tab.receiver_loaded = false;
            tab.content = ContentState::default();
        }
    }

    pub fn set_active(&self, tab_id: Option<TabId>) {
        self.lock().active = tab_id;
    }

    pub fn set_receiver_loaded(&self, tab_id: TabId, loaded: bool) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.receiver_loaded = loaded;
        }
    }

    /// Make every injection into this tab fail.
    pub fn set_injectable(&self, tab_id: TabId, injectable: bool) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.injectable = injectable;
        }
    }

    /// Make every send to this tab fail with `error`.
    pub fn fail_sends(&self, tab_id: TabId, error: impl Into<String>) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.send_failure = Some(error.into());
        }
    }

    /// Make injecting `script` fail in every tab.
    pub fn fail_injection(&self, script: impl Into<String>) {
        self.lock().failing_scripts.insert(script.into());
    }

    /// Open or close the popup. A closed popup has no receiver.
    pub fn set_popup_open(&self, open: bool) {
        self.lock().popup_open = open;
    }

    /// Overwrite the simulated content-script state of a tab.
    pub fn set_content_state(&self, tab_id: TabId, state: ContentState) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.content = state;
        }
    }

    pub fn content_state(&self, tab_id: TabId) -> Option<ContentState> {
        self.lock().tabs.get(&tab_id).map(|t| t.content.clone())
    }

    /// Messages the tab's content script accepted.
    pub fn tab_inbox(&self, tab_id: TabId) -> Vec<Value> {
        self.lock()
            .tabs
            .get(&tab_id)
            .map(|t| t.inbox.clone())
            .unwrap_or_default()
    }

    /// Messages the popup accepted.
    pub fn popup_inbox(&self) -> Vec<Value> {
        self.lock().popup_inbox.clone()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    /// `(tab_id, script)` for every injection attempt, in order.
    pub fn injections(&self) -> Vec<(TabId, String)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Inject { tab_id, script } => Some((*tab_id, script.clone())),
                _ => None,
            })
            .collect()
    }
}

fn message_name(message: &Value) -> String {
    message
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl TabTransport for MemoryTransport {
    async fn get_tab(&self, tab_id: TabId) -> Option<TabInfo> {
        let mut browser = self.lock();
        browser.calls.push(TransportCall::GetTab(tab_id));
        browser.tabs.get(&tab_id).map(|t| t.info.clone())
    }

    async fn query_active_tab(&self) -> Option<TabInfo> {
        let mut browser = self.lock();
        browser.calls.push(TransportCall::QueryActiveTab);
        let active = browser.active?;
        browser.tabs.get(&active).map(|t| t.info.clone())
    }

    async fn send_to_tab(&self, tab_id: TabId, message: &Value) -> Result<Value, String> {
        let mut browser = self.lock();
        browser.calls.push(TransportCall::Send {
            tab_id,
            name: message_name(message),
        });
        let tab = browser
            .tabs
            .get_mut(&tab_id)
            .ok_or_else(|| format!("No tab with id: {tab_id}."))?;
        if let Some(error) = &tab.send_failure {
            return Err(error.clone());
        }
        if !tab.receiver_loaded {
            return Err(RECEIVER_MISSING.to_string());
        }
        tab.inbox.push(message.clone());
        Ok(tab.content.handle(message))
    }

    async fn inject_script(&self, tab_id: TabId, script: &str) -> Result<(), String> {
        let mut browser = self.lock();
        browser.calls.push(TransportCall::Inject {
            tab_id,
            script: script.to_string(),
        });
        let failing = browser.failing_scripts.contains(script);
        let tab = browser
            .tabs
            .get_mut(&tab_id)
            .ok_or_else(|| format!("No tab with id: {tab_id}."))?;
        if failing || !tab.injectable {
            return Err(CANNOT_INJECT.to_string());
        }
        if script == self.receiver_script {
            tab.receiver_loaded = true;
        }
        Ok(())
    }

    async fn send_to_extension(&self, message: &Value) -> Result<(), String> {
        let mut browser = self.lock();
        browser.calls.push(TransportCall::Extension {
            name: message_name(message),
        });
        if !browser.popup_open {
            return Err(RECEIVER_MISSING.to_string());
        }
        browser.popup_inbox.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_tab_becomes_active() {
        let browser = MemoryTransport::new();
        browser.add_tab(TabInfo::new(1, "https://a.test", "A"), true);
        browser.add_tab(TabInfo::new(2, "https://b.test", "B"), true);
        assert_eq!(browser.query_active_tab().await.map(|t| t.id), Some(1));
        browser.remove_tab(1);
        assert!(browser.query_active_tab().await.is_none());
    }

    #[tokio::test]
    async fn unloaded_receiver_reports_missing() {
        let browser = MemoryTransport::new();
        browser.add_tab(TabInfo::new(1, "https://a.test", "A"), false);
        let err = browser
            .send_to_tab(1, &json!({"name": "ping"}))
            .await
            .unwrap_err();
        assert!(super::super::is_receiver_missing(&err));

        browser.inject_script(1, "content.js").await.unwrap();
        let reply = browser.send_to_tab(1, &json!({"name": "ping"})).await.unwrap();
        assert_eq!(reply["going"], false);
    }

    #[tokio::test]
    async fn content_script_tracks_commands() {
        let browser = MemoryTransport::new();
        browser.add_tab(TabInfo::new(1, "https://a.test", "A"), true);
        browser
            .send_to_tab(1, &json!({"name": "start", "options": {"selector": "article p"}}))
            .await
            .unwrap();
        let state = browser.content_state(1).unwrap();
        assert!(state.going);
        assert_eq!(state.selector.as_deref(), Some("article p"));

        let reply = browser.send_to_tab(1, &json!({"name": "toggle"})).await.unwrap();
        assert_eq!(reply["going"], false);
    }

    #[tokio::test]
    async fn navigation_unloads_content_script() {
        let browser = MemoryTransport::new();
        browser.add_tab(TabInfo::new(1, "https://a.test", "A"), true);
        browser.navigate(1, "https://b.test");
        assert!(browser.send_to_tab(1, &json!({"name": "ping"})).await.is_err());
        assert_eq!(browser.get_tab(1).await.unwrap().url, "https://b.test");
    }

    #[tokio::test]
    async fn closed_popup_rejects_broadcast() {
        let browser = MemoryTransport::new();
        browser.set_popup_open(false);
        assert!(browser.send_to_extension(&json!({"name": "x"})).await.is_err());
        browser.set_popup_open(true);
        browser.send_to_extension(&json!({"name": "x"})).await.unwrap();
        assert_eq!(browser.popup_inbox().len(), 1);
    }
}
