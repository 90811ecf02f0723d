//! wave-reader-core: message routing core for the Wave Reader extension
//!
//! Wave Reader runs in three JavaScript contexts (popup, background, content
//! script). This crate holds the part that moves messages between them.
//!
//! # Architecture
//!
//! ```text
//! popup ──┐                                  ┌──> content script (tab)
//!         ├─> Dispatcher ─> ContentScriptLink┤    (inject + retry once)
//! content ┘      │                           └──> extension pages
//!                ├─> tabs / health / history
//!                └─> collaborators (backend, ml, analytics, toggles)
//!
//! component ─> MessageRouter ─> priority queues ─> ComponentHandler
//! ```
//!
//! # Modules
//!
//! - `message`: envelope, normalization and the message factory
//! - `transport`: browser messaging seam and the inject-and-retry link
//! - `dispatcher`: background handler table, tab state, health and history
//! - `router`: priority router with timeouts, retries and statistics
//! - `tabs`, `health`, `session`, `history`: dispatcher state
//! - `collaborators`: backend proxy, ML service, analytics and feature toggles
//! - `diagnostics`: loop-detection reports from the popup
//! - `retry`: backoff policy shared by the router
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod collaborators;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod history;
pub mod logging;
pub mod message;
pub mod retry;
pub mod router;
pub mod session;
pub mod tabs;
pub mod transport;

pub use config::Config;
pub use dispatcher::{Dispatcher, Response};
pub use error::{Error, Result};
pub use message::{Message, MessageFactory, MessageSender};
pub use router::{MessageRouter, Priority, RouterMessage};
pub use transport::{ContentScriptLink, TabInfo, TabTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
