//! Loop-detection diagnostics sink.
//!
//! UI state machines report how often each event fired and each state was
//! entered during a reporting window. Anything above the thresholds is
//! logged as a likely loop. Reports never influence control flow.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// An event firing more often than this in one window is flagged.
pub const EVENT_LOOP_THRESHOLD: u64 = 5;
/// A state entered more often than this in one window is flagged.
pub const STATE_LOOP_THRESHOLD: u64 = 3;

/// One counter above its threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub name: String,
    pub count: u64,
    pub threshold: u64,
}

/// Parsed loop-detection report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopReport {
    pub event_counts: BTreeMap<String, u64>,
    pub state_visits: BTreeMap<String, u64>,
    pub event_anomalies: Vec<Anomaly>,
    pub state_anomalies: Vec<Anomaly>,
}

impl LoopReport {
    /// Parse `{eventCounts: {..}, stateVisits: {..}}`. Missing or malformed
    /// sections count as empty; non-numeric counters are skipped.
    pub fn from_stats(stats: &Value) -> Self {
        let event_counts = counters(stats.get("eventCounts"));
        let state_visits = counters(stats.get("stateVisits"));
        let event_anomalies = over(&event_counts, EVENT_LOOP_THRESHOLD);
        let state_anomalies = over(&state_visits, STATE_LOOP_THRESHOLD);
        Self {
            event_counts,
            state_visits,
            event_anomalies,
            state_anomalies,
        }
    }

    pub fn has_anomalies(&self) -> bool {
        !self.event_anomalies.is_empty() || !self.state_anomalies.is_empty()
    }

    /// Log the counters, with a warning per anomaly.
    pub fn log(&self, from: &str) {
        info!(
            from,
            events = self.event_counts.len(),
            states = self.state_visits.len(),
            "Loop detection stats received"
        );
        for anomaly in &self.event_anomalies {
            warn!(
                from,
                event = %anomaly.name,
                count = anomaly.count,
                threshold = anomaly.threshold,
                "Possible event loop"
            );
        }
        for anomaly in &self.state_anomalies {
            warn!(
                from,
                state = %anomaly.name,
                count = anomaly.count,
                threshold = anomaly.threshold,
                "Possible state loop"
            );
        }
    }
}

fn counters(section: Option<&Value>) -> BTreeMap<String, u64> {
    let Some(Value::Object(map)) = section else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(name, count)| count.as_u64().map(|n| (name.clone(), n)))
        .collect()
}

fn over(counts: &BTreeMap<String, u64>, threshold: u64) -> Vec<Anomaly> {
    counts
        .iter()
        .filter(|&(_, &count)| count > threshold)
        .map(|(name, &count)| Anomaly {
            name: name.clone(),
            count,
            threshold,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_counts_above_thresholds() {
        let report = LoopReport::from_stats(&json!({
            "eventCounts": {"START": 6, "STOP": 5},
            "stateVisits": {"waving": 4, "idle": 3},
        }));
        assert_eq!(report.event_anomalies.len(), 1);
        assert_eq!(report.event_anomalies[0].name, "START");
        assert_eq!(report.state_anomalies.len(), 1);
        assert_eq!(report.state_anomalies[0].name, "waving");
        assert!(report.has_anomalies());
    }

    #[test]
    fn at_threshold_is_quiet() {
        let report = LoopReport::from_stats(&json!({
            "eventCounts": {"START": 5},
            "stateVisits": {"waving": 3},
        }));
        assert!(!report.has_anomalies());
    }

    #[test]
    fn malformed_stats_are_empty() {
        let report = LoopReport::from_stats(&json!("nope"));
        assert_eq!(report, LoopReport::default());
        let report = LoopReport::from_stats(&json!({"eventCounts": {"A": "x", "B": 9}}));
        assert_eq!(report.event_counts.len(), 1);
    }
}
