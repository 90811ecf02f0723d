//! Message envelope, normalization, and factory.
//!
//! Every message crossing a context boundary is a flat JSON object with a
//! `name` and a `from`. Inbound messages may arrive double-wrapped by a
//! transport layer or carry a legacy `type` field; [`normalize`] flattens
//! those before [`MessageFactory`] builds the typed view.
//!
//! Unknown names are not errors: they produce [`MessageBody::Unrecognized`]
//! carrying the supplied attributes unchanged.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::TabId;

/// Free-form message attributes.
pub type Attributes = serde_json::Map<String, Value>;

/// Origin used when nothing else identifies the sender.
pub const UNKNOWN_SENDER: &str = "unknown";

/// Known message names. All lower-case; lookups happen after normalization.
pub mod names {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const HEALTH_CHECK: &str = "health-check";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const TOGGLE: &str = "toggle";
    pub const SELECTION_MADE: &str = "selection-made";
    pub const START_SELECTION: &str = "start-selection";
    pub const UPDATE_SETTINGS: &str = "update-settings";
    pub const GET_TAB_STATE: &str = "get-tab-state";
    pub const MESSAGE_HISTORY: &str = "message-history";
    pub const ML_RECOMMENDATION_REQUEST: &str = "ml-recommendation-request";
    pub const SETTINGS_RESET_REQUEST: &str = "settings-reset-request";
    pub const ANALYTICS_EVENT: &str = "analytics-event";
    pub const EXTENSION_STATUS_REQUEST: &str = "extension-status-request";
    pub const BACKEND_REQUEST: &str = "backend-request";
    pub const GRAPHQL_REQUEST: &str = "graphql-request";
    pub const SET_BACKEND_TOGGLE: &str = "set-backend-toggle";
    pub const LOOP_DETECTION_STATS: &str = "loop_detection_stats";
}

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identity of the context that sent an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    /// Set when the message came from a tab's content script
    pub tab_id: Option<TabId>,
    /// URL of the sending document
    pub url: Option<String>,
}

impl MessageSender {
    /// Sender for an extension page such as the popup.
    pub fn popup() -> Self {
        Self {
            tab_id: None,
            url: Some("chrome-extension://wave-reader/popup.html".to_string()),
        }
    }

    /// Sender for a content script running in a tab.
    pub fn content(tab_id: TabId, url: impl Into<String>) -> Self {
        Self {
            tab_id: Some(tab_id),
            url: Some(url.into()),
        }
    }

    /// Context name inferred from the sender identity.
    pub fn context(&self) -> &'static str {
        if self.tab_id.is_some() {
            return "content";
        }
        match self.url.as_deref() {
            Some(url) if url.starts_with("chrome-extension://") || url.starts_with("moz-extension://") => {
                "popup"
            }
            _ => UNKNOWN_SENDER,
        }
    }
}

/// Flatten a raw inbound message into a single attribute map.
///
/// - a nested `message` object is unwrapped; the outer `source`/`from` fill
///   in only what the inner object lacks
/// - a legacy `type` without `name` becomes a lower-cased `name`
/// - `name` is lower-cased
/// - a missing `from` is taken from `source`, then from the sender context
///
/// Non-object input yields an empty map with no `name`.
pub fn normalize(raw: Value, sender: &MessageSender) -> Attributes {
    let Value::Object(mut outer) = raw else {
        return Attributes::new();
    };

    while let Some(Value::Object(_)) = outer.get("message") {
        let Some(Value::Object(mut inner)) = outer.remove("message") else {
            break;
        };
        for key in ["source", "from"] {
            if !inner.contains_key(key) {
                if let Some(value) = outer.get(key) {
                    inner.insert(key.to_string(), value.clone());
                }
            }
        }
        outer = inner;
    }

    if !outer.contains_key("name") {
        if let Some(Value::String(legacy)) = outer.remove("type") {
            outer.insert("name".to_string(), Value::String(legacy));
        }
    }

    if let Some(Value::String(name)) = outer.get_mut("name") {
        *name = name.to_lowercase();
    }

    let has_from = matches!(outer.get("from"), Some(Value::String(s)) if !s.is_empty());
    if !has_from {
        let inferred = match outer.get("source") {
            Some(Value::String(source)) if !source.is_empty() => source.clone(),
            _ => sender.context().to_string(),
        };
        outer.insert("from".to_string(), Value::String(inferred));
    }

    outer
}

/// Typed view of a message, one variant per known name.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Initialize,
    Ping {
        tab_id: Option<TabId>,
        current_state: Attributes,
    },
    HealthCheck,
    Start {
        tab_id: Option<TabId>,
        options: Attributes,
    },
    Stop {
        tab_id: Option<TabId>,
    },
    Toggle {
        tab_id: Option<TabId>,
        options: Attributes,
    },
    SelectionMade {
        selector: Option<String>,
    },
    StartSelection {
        tab_id: Option<TabId>,
    },
    UpdateSettings {
        tab_id: Option<TabId>,
        settings: Attributes,
    },
    GetTabState {
        tab_id: Option<TabId>,
    },
    MessageHistory {
        limit: Option<usize>,
    },
    MlRecommendationRequest {
        domain: Option<String>,
        path: Option<String>,
        selector: Option<String>,
    },
    SettingsResetRequest,
    AnalyticsEvent {
        event: Option<String>,
        data: Value,
    },
    ExtensionStatusRequest,
    BackendRequest {
        endpoint: Option<String>,
        options: Value,
        payload: Value,
    },
    GraphqlRequest {
        endpoint: Option<String>,
        query: Option<String>,
        variables: Value,
    },
    SetBackendToggle {
        enabled: Option<bool>,
    },
    LoopDetectionStats {
        stats: Value,
    },
    /// Any other name; attributes pass through untouched.
    Unrecognized(Attributes),
}

/// A normalized message: envelope fields plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub name: String,
    pub from: String,
    pub timestamp: u64,
    /// Every attribute except `name` and `from`. An integer `timestamp` is
    /// lifted into [`Message::timestamp`]; any other `timestamp` stays here.
    pub attributes: Attributes,
    pub body: MessageBody,
}

impl Message {
    /// Explicit tab id carried by the message, if any.
    pub fn tab_id(&self) -> Option<TabId> {
        tab_id_attr(&self.attributes)
    }

    /// Optional `source` field.
    pub fn source(&self) -> Option<&str> {
        self.attributes.get("source").and_then(Value::as_str)
    }

    /// Look up a raw attribute.
    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Flat JSON form, the shape that crosses context boundaries.
    pub fn to_value(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert("from".to_string(), Value::String(self.from.clone()));
        map.entry("timestamp")
            .or_insert_with(|| Value::from(self.timestamp));
        Value::Object(map)
    }
}

fn str_attr(attrs: &Attributes, key: &str) -> Option<String> {
    attrs
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn object_attr(attrs: &Attributes, key: &str) -> Attributes {
    match attrs.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Attributes::new(),
    }
}

fn value_attr(attrs: &Attributes, key: &str) -> Value {
    attrs.get(key).cloned().unwrap_or(Value::Null)
}

fn tab_id_attr(attrs: &Attributes) -> Option<TabId> {
    attrs
        .get("tabId")
        .and_then(Value::as_u64)
        .and_then(|id| TabId::try_from(id).ok())
}

/// Builds typed messages from raw data. Construction never fails.
pub struct MessageFactory;

impl MessageFactory {
    /// Build a message from a name, an origin, and free-form attributes.
    pub fn create_message(name: &str, from: &str, mut attributes: Attributes) -> Message {
        attributes.remove("name");
        attributes.remove("from");
        let timestamp = match attributes.get("timestamp").and_then(Value::as_u64) {
            Some(ts) => {
                attributes.remove("timestamp");
                ts
            }
            None => epoch_ms(),
        };
        let body = Self::body_for(name, &attributes);
        Message {
            name: name.to_string(),
            from: from.to_string(),
            timestamp,
            attributes,
            body,
        }
    }

    /// Build a message from an already normalized attribute map.
    pub fn from_attributes(mut attributes: Attributes) -> Message {
        let name = attributes
            .remove("name")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let from = attributes
            .remove("from")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        Self::create_message(&name, &from, attributes)
    }

    fn body_for(name: &str, attrs: &Attributes) -> MessageBody {
        match name.to_lowercase().as_str() {
            names::INITIALIZE => MessageBody::Initialize,
            names::PING => MessageBody::Ping {
                tab_id: tab_id_attr(attrs),
                current_state: object_attr(attrs, "currentState"),
            },
            names::HEALTH_CHECK => MessageBody::HealthCheck,
            names::START => MessageBody::Start {
                tab_id: tab_id_attr(attrs),
                options: object_attr(attrs, "options"),
            },
            names::STOP => MessageBody::Stop {
                tab_id: tab_id_attr(attrs),
            },
            names::TOGGLE => MessageBody::Toggle {
                tab_id: tab_id_attr(attrs),
                options: object_attr(attrs, "options"),
            },
            names::SELECTION_MADE => MessageBody::SelectionMade {
                selector: str_attr(attrs, "selector"),
            },
            names::START_SELECTION => MessageBody::StartSelection {
                tab_id: tab_id_attr(attrs),
            },
            names::UPDATE_SETTINGS => MessageBody::UpdateSettings {
                tab_id: tab_id_attr(attrs),
                settings: object_attr(attrs, "settings"),
            },
            names::GET_TAB_STATE => MessageBody::GetTabState {
                tab_id: tab_id_attr(attrs),
            },
            names::MESSAGE_HISTORY => MessageBody::MessageHistory {
                limit: attrs
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize),
            },
            names::ML_RECOMMENDATION_REQUEST => MessageBody::MlRecommendationRequest {
                domain: str_attr(attrs, "domain"),
                path: str_attr(attrs, "path"),
                selector: str_attr(attrs, "selector"),
            },
            names::SETTINGS_RESET_REQUEST => MessageBody::SettingsResetRequest,
            names::ANALYTICS_EVENT => MessageBody::AnalyticsEvent {
                event: str_attr(attrs, "event"),
                data: value_attr(attrs, "data"),
            },
            names::EXTENSION_STATUS_REQUEST => MessageBody::ExtensionStatusRequest,
            names::BACKEND_REQUEST => MessageBody::BackendRequest {
                endpoint: str_attr(attrs, "endpoint"),
                options: value_attr(attrs, "options"),
                payload: value_attr(attrs, "payload"),
            },
            names::GRAPHQL_REQUEST => MessageBody::GraphqlRequest {
                endpoint: str_attr(attrs, "endpoint"),
                query: str_attr(attrs, "query"),
                variables: value_attr(attrs, "variables"),
            },
            names::SET_BACKEND_TOGGLE => MessageBody::SetBackendToggle {
                enabled: attrs.get("enabled").and_then(Value::as_bool),
            },
            names::LOOP_DETECTION_STATS => MessageBody::LoopDetectionStats {
                stats: value_attr(attrs, "stats"),
            },
            _ => MessageBody::Unrecognized(attrs.clone()),
        }
    }
}
