//! Error types for wave-reader-core

use std::fmt::Write;
use thiserror::Error;

use crate::transport::TabId;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for wave-reader-core
#[derive(Error, Debug)]
pub enum Error {
    /// Background to content-script delivery errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Priority router errors
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A required request field is missing or malformed
    #[error("{0}")]
    Validation(String),

    /// An excluded collaborator (backend proxy, ML service, toggles) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (ticker failures, closed channels, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Shorthand for a missing-field validation failure.
    pub fn missing(field: &str) -> Self {
        Self::Validation(format!("Missing {field}"))
    }

    /// True when the content script could not be reached even after injection.
    ///
    /// Callers such as `stop` treat this as "already in the desired state".
    #[must_use]
    pub fn is_content_script_not_ready(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::ContentScriptNotReady { .. })
        )
    }

    /// True when the tab itself cannot host a content script.
    #[must_use]
    pub fn is_tab_access(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_tab_access())
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Transport(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Router(RouterError::NoHandler(component)) => Some(
                Remediation::new(format!(
                    "Register a handler for component '{component}' before sending to it."
                ))
                .alternative("Address the message to a registered component explicitly."),
            ),
            Self::Validation(_) => Some(Remediation::new(
                "Add the missing field to the request and resend it.",
            )),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Each input line must hold exactly one JSON object."),
            ),
            Self::Router(_) | Self::Collaborator(_) | Self::Io(_) | Self::Runtime(_) => None,
        }
    }
}

/// Errors raised by the cross-context transport primitive
#[derive(Error, Debug)]
pub enum TransportError {
    /// The tab id does not resolve to an open tab
    #[error("Tab not found: {0}")]
    TabNotFound(TabId),

    /// No tab is focused in the current window
    #[error("No active tab")]
    NoActiveTab,

    /// Browser-internal page; content scripts can never run there
    #[error("Cannot access restricted URL in tab {tab_id}: {url}")]
    RestrictedUrl { tab_id: TabId, url: String },

    /// A direct send failed for a reason other than a missing receiver
    #[error("Delivery to tab {tab_id} failed: {message}")]
    Delivery { tab_id: TabId, message: String },

    /// Receiver script could not be injected
    #[error("Injecting {script} into tab {tab_id} failed: {message}")]
    Injection {
        tab_id: TabId,
        script: String,
        message: String,
    },

    /// Receiver still absent after inject-and-retry
    #[error("Content script not ready in tab {tab_id}: {message}")]
    ContentScriptNotReady { tab_id: TabId, message: String },

    /// Sending to the extension pages (popup) failed
    #[error("Extension broadcast failed: {0}")]
    Broadcast(String),
}

impl TransportError {
    /// Tab cannot be resolved or cannot host a content script.
    #[must_use]
    pub fn is_tab_access(&self) -> bool {
        matches!(
            self,
            Self::TabNotFound(_) | Self::NoActiveTab | Self::RestrictedUrl { .. }
        )
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::TabNotFound(_) | Self::NoActiveTab => {
                Remediation::new("Focus a regular web page tab and retry.")
                    .alternative("The tab may have been closed while the request was in flight.")
            }
            Self::RestrictedUrl { url, .. } => Remediation::new(format!(
                "{url} is a browser-internal page. Open a regular web page to use Wave Reader."
            )),
            Self::Delivery { .. } | Self::Broadcast(_) => {
                Remediation::new("Reload the extension and retry.")
                    .alternative("Check the background console for the delivery error.")
            }
            Self::Injection { .. } | Self::ContentScriptNotReady { .. } => {
                Remediation::new("Reload the page so the content script loads, then retry.")
                    .alternative("Pages opened before the extension was installed need a reload.")
            }
        }
    }
}

/// Errors raised by the priority router
#[derive(Error, Debug)]
pub enum RouterError {
    /// Target component has no registered handler
    #[error("No handler registered for component: {0}")]
    NoHandler(String),

    /// Target component's handler returned an error
    #[error("Component {component} failed: {message}")]
    HandlerFailed { component: String, message: String },

    /// All attempts of `send_with_retry` failed
    #[error("Message failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry."),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .alternative("Run `wave-reader config` to print the effective defaults.")
            }
        }
    }
}
