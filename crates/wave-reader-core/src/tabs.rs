//! Per-tab wave state owned by the dispatcher.
//!
//! `going` and `state` are two views of one fact. [`TabState`] keeps a single
//! [`WaveState`] and derives `going` from it, so the pair can never disagree.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::{TabId, TabInfo};

// =============================================================================
// Wave State
// =============================================================================

/// Whether the wave effect is running in a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveState {
    Waving,
    #[default]
    Stopped,
}

impl WaveState {
    #[must_use]
    pub const fn from_going(going: bool) -> Self {
        if going { Self::Waving } else { Self::Stopped }
    }

    #[must_use]
    pub const fn is_going(self) -> bool {
        matches!(self, Self::Waving)
    }
}

impl fmt::Display for WaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waving => write!(f, "waving"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Tab State
// =============================================================================

/// Tracked activity for one tab. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabState {
    tab_id: TabId,
    url: String,
    title: String,
    going: bool,
    state: WaveState,
    selector: Option<String>,
    last_ping: Option<u64>,
    last_activity: u64,
    start_time: Option<u64>,
    stop_time: Option<u64>,
}

impl TabState {
    pub fn new(tab_id: TabId, url: impl Into<String>, title: impl Into<String>, now: u64) -> Self {
        Self {
            tab_id,
            url: url.into(),
            title: title.into(),
            going: false,
            state: WaveState::Stopped,
            selector: None,
            last_ping: None,
            last_activity: now,
            start_time: None,
            stop_time: None,
        }
    }

    fn transition(&mut self, next: WaveState, now: u64) {
        self.state = next;
        self.going = next.is_going();
        self.last_activity = now;
        match next {
            WaveState::Waving => self.start_time = Some(now),
            WaveState::Stopped => self.stop_time = Some(now),
        }
    }

    pub fn mark_started(&mut self, now: u64) {
        self.transition(WaveState::Waving, now);
    }

    pub fn mark_stopped(&mut self, now: u64) {
        self.transition(WaveState::Stopped, now);
    }

    /// Flip the wave state and return the new `going` value.
    pub fn toggle(&mut self, now: u64) -> bool {
        let next = WaveState::from_going(!self.going);
        self.transition(next, now);
        self.going
    }

    /// Adopt the state a content script reported, without touching start/stop times
    /// unless the state actually changed.
    pub fn sync_going(&mut self, going: bool, now: u64) {
        if going != self.going {
            self.transition(WaveState::from_going(going), now);
        }
    }

    pub fn record_ping(&mut self, now: u64) {
        self.last_ping = Some(now);
        self.last_activity = now;
    }

    pub fn set_selector(&mut self, selector: impl Into<String>, now: u64) {
        self.selector = Some(selector.into());
        self.last_activity = now;
    }

    /// Record a navigation. Navigating unloads the content script, so the
    /// wave is stopped.
    pub fn navigated(&mut self, url: impl Into<String>, title: impl Into<String>, now: u64) {
        self.url = url.into();
        self.title = title.into();
        if self.going {
            self.transition(WaveState::Stopped, now);
        } else {
            self.last_activity = now;
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn going(&self) -> bool {
        self.going
    }

    pub fn state(&self) -> WaveState {
        self.state
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    pub fn last_ping(&self) -> Option<u64> {
        self.last_ping
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<u64> {
        self.stop_time
    }
}

// =============================================================================
// Registry
// =============================================================================

/// All tracked tabs, keyed by tab id.
#[derive(Debug, Default)]
pub struct TabRegistry {
    tabs: HashMap<TabId, TabState>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the state for `tab`, creating it on first sight.
    pub fn entry(&mut self, tab: &TabInfo, now: u64) -> &mut TabState {
        self.tabs
            .entry(tab.id)
            .or_insert_with(|| TabState::new(tab.id, tab.url.clone(), tab.title.clone(), now))
    }

    /// Navigation complete: create or update the tab.
    pub fn navigated(&mut self, tab: &TabInfo, now: u64) -> &TabState {
        let state = self
            .tabs
            .entry(tab.id)
            .or_insert_with(|| TabState::new(tab.id, tab.url.clone(), tab.title.clone(), now));
        state.navigated(tab.url.clone(), tab.title.clone(), now);
        state
    }

    pub fn get(&self, tab_id: TabId) -> Option<&TabState> {
        self.tabs.get(&tab_id)
    }

    pub fn get_mut(&mut self, tab_id: TabId) -> Option<&mut TabState> {
        self.tabs.get_mut(&tab_id)
    }

    pub fn remove(&mut self, tab_id: TabId) -> Option<TabState> {
        self.tabs.remove(&tab_id)
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// Number of tabs currently waving.
    pub fn waving_count(&self) -> usize {
        self.tabs.values().filter(|t| t.going).count()
    }

    /// Copy of every tracked tab, ordered by id.
    pub fn snapshot(&self) -> Vec<TabState> {
        let mut tabs: Vec<TabState> = self.tabs.values().cloned().collect();
        tabs.sort_by_key(TabState::tab_id);
        tabs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: TabId) -> TabInfo {
        TabInfo::new(id, format!("https://site{id}.test"), format!("Site {id}"))
    }

    #[test]
    fn new_tab_is_stopped() {
        let state = TabState::new(1, "https://a.test", "A", 10);
        assert!(!state.going());
        assert_eq!(state.state(), WaveState::Stopped);
        assert_eq!(state.last_activity(), 10);
    }

    #[test]
    fn transitions_keep_going_and_state_aligned() {
        let mut state = TabState::new(1, "https://a.test", "A", 0);
        state.mark_started(5);
        assert!(state.going());
        assert_eq!(state.state(), WaveState::Waving);
        assert_eq!(state.start_time(), Some(5));

        assert!(!state.toggle(6));
        assert_eq!(state.state(), WaveState::Stopped);
        assert_eq!(state.stop_time(), Some(6));

        state.sync_going(true, 7);
        assert_eq!(state.state(), WaveState::Waving);
        state.sync_going(true, 8);
        assert_eq!(state.start_time(), Some(7));
    }

    #[test]
    fn navigation_stops_the_wave() {
        let mut state = TabState::new(1, "https://a.test", "A", 0);
        state.mark_started(1);
        state.navigated("https://b.test", "B", 2);
        assert!(!state.going());
        assert_eq!(state.url(), "https://b.test");
        assert_eq!(state.title(), "B");
    }

    #[test]
    fn serializes_both_views() {
        let mut state = TabState::new(3, "https://a.test", "A", 0);
        state.mark_started(1);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["going"], true);
        assert_eq!(json["state"], "waving");
        assert_eq!(json["tabId"], 3);
        assert!(json.get("lastActivity").is_some());
    }

    #[test]
    fn registry_entry_creates_once() {
        let mut registry = TabRegistry::new();
        registry.entry(&tab(1), 0).mark_started(1);
        registry.entry(&tab(1), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).unwrap().going());
        assert_eq!(registry.waving_count(), 1);
    }

    #[test]
    fn registry_snapshot_is_ordered() {
        let mut registry = TabRegistry::new();
        for id in [3, 1, 2] {
            registry.navigated(&tab(id), 0);
        }
        let ids: Vec<TabId> = registry.snapshot().iter().map(TabState::tab_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(registry.remove(2).is_some());
        assert!(registry.remove(2).is_none());
        assert_eq!(registry.len(), 2);
    }
}
