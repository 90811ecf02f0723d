//! Background session identity.
//!
//! One session per dispatcher lifetime; never persisted. The id tags
//! `initialize` and health responses so the popup can tell when the
//! background context restarted.

use rand::Rng;
use serde::Serialize;

use crate::message::epoch_ms;

const SUFFIX_LEN: usize = 9;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Session identity, created once at dispatcher construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    session_id: String,
    started_at: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::started_at(epoch_ms())
    }

    pub fn started_at(now: u64) -> Self {
        Self {
            session_id: generate_session_id(now),
            started_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn start_time(&self) -> u64 {
        self.started_at
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// `session_<epoch-ms>_<9 lowercase alphanumerics>`
pub fn generate_session_id(now: u64) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| char::from(SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())]))
        .collect();
    format!("session_{now}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_has_expected_shape() {
        let id = generate_session_id(1_700_000_000_000);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert_eq!(parts[1], "1700000000000");
        assert_eq!(parts[2].len(), 9);
        assert!(
            parts[2]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn sessions_differ() {
        let a = Session::started_at(1);
        let b = Session::started_at(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.start_time(), 1);
    }
}
