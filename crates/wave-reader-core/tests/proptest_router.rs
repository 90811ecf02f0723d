//! Property-based tests for the priority router.
//!
//! Validates:
//! 1. Route resolution is case-insensitive and always lands on a known component
//! 2. A drain pass visits queues strictly in priority order
//! 3. Draining to empty processes every queued message exactly once
//! 4. send_with_retry makes exactly max_retries + 1 attempts against a failing handler
//! 5. send_with_retry stops at the first success
//! 6. Stats stay within bounds and count every send

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use proptest::prelude::*;
use serde_json::json;

use wave_reader_core::config::RouterConfig;
use wave_reader_core::error::{Error, RouterError};
use wave_reader_core::router::{MAIN_APP, MessageRouter, Priority, ROUTES, RouterMessage, handler_fn, resolve_route};

// =============================================================================
// Strategies
// =============================================================================

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Critical),
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

fn arb_message_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("WAVE_READER_START".to_string()),
        Just("tab_changed".to_string()),
        Just("Settings_Update".to_string()),
        Just("SELECTOR_PICKED".to_string()),
        Just("button_click".to_string()),
        "[a-zA-Z_]{0,16}",
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime")
}

/// Router with an echo handler on every routed component.
fn echo_router() -> MessageRouter {
    let router = MessageRouter::new(RouterConfig::default());
    for component in ROUTES.iter().map(|(_, c)| *c).chain([MAIN_APP]) {
        router.register_component(component, handler_fn(|m| Ok(json!({"type": m.message_type}))));
    }
    router
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn route_is_case_insensitive(message_type in arb_message_type()) {
        let upper = resolve_route(&message_type.to_uppercase());
        let lower = resolve_route(&message_type.to_lowercase());
        prop_assert_eq!(upper, lower);

        let known: HashSet<&str> = ROUTES.iter().map(|(_, c)| *c).chain([MAIN_APP]).collect();
        prop_assert!(known.contains(resolve_route(&message_type)));
    }

    #[test]
    fn drain_pass_respects_priority(
        messages in prop::collection::vec((arb_message_type(), arb_priority()), 1..40)
    ) {
        let rt = runtime();
        rt.block_on(async {
            let router = echo_router();
            let mut ids = HashSet::new();
            for (message_type, priority) in &messages {
                let id = router.enqueue(
                    RouterMessage::new(message_type.clone(), "prop").with_priority(*priority),
                );
                ids.insert(id);
            }
            prop_assert_eq!(ids.len(), messages.len());

            let mut processed = HashSet::new();
            loop {
                let before: Vec<usize> = Priority::ALL.iter().map(|p| router.queue_len(*p)).collect();
                let pass = router.drain_queues().await;
                if pass.is_empty() {
                    break;
                }
                // One message from every non-empty queue, critical first.
                prop_assert_eq!(pass.len(), before.iter().filter(|n| **n > 0).count());
                let ranks: Vec<usize> = pass
                    .iter()
                    .map(|r| {
                        router
                            .recent_history(usize::MAX)
                            .into_iter()
                            .find(|e| e.message_id == r.message_id)
                            .map(|e| e.priority.rank())
                            .unwrap_or(usize::MAX)
                    })
                    .collect();
                prop_assert!(ranks.windows(2).all(|w| w[0] < w[1]), "ranks {:?}", ranks);
                for result in pass {
                    prop_assert!(result.success);
                    prop_assert!(processed.insert(result.message_id));
                }
            }
            prop_assert_eq!(processed, ids);
            prop_assert_eq!(router.get_stats().total_queued(), 0);
            Ok(())
        })?;
    }

    #[test]
    fn retry_makes_exactly_max_plus_one_attempts(max_retries in 0u32..5) {
        let rt = runtime();
        rt.block_on(async {
            let router = MessageRouter::new(RouterConfig::default());
            let calls = Arc::new(AtomicU32::new(0));
            let seen = Arc::clone(&calls);
            router.register_component(
                "wave-tabs",
                handler_fn(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Runtime("boom".to_string()))
                }),
            );

            let err = router
                .send_with_retry(RouterMessage::new("TAB_UPDATE", "prop"), max_retries)
                .await
                .unwrap_err();
            prop_assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
            match err {
                Error::Router(RouterError::RetriesExhausted { attempts, last_error }) => {
                    prop_assert_eq!(attempts, max_retries + 1);
                    prop_assert!(last_error.contains("boom"));
                }
                other => prop_assert!(false, "unexpected error {:?}", other),
            }
            Ok(())
        })?;
    }

    #[test]
    fn retry_stops_at_first_success(failures in 0u32..4, extra in 0u32..3) {
        let max_retries = failures + extra;
        let rt = runtime();
        rt.block_on(async {
            let router = MessageRouter::new(RouterConfig::default());
            let calls = Arc::new(AtomicU32::new(0));
            let seen = Arc::clone(&calls);
            router.register_component(
                "settings",
                handler_fn(move |_| {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        Err(Error::Runtime(format!("failure {n}")))
                    } else {
                        Ok(json!({"attempt": n}))
                    }
                }),
            );

            let result = router
                .send_with_retry(RouterMessage::new("SETTING_SAVE", "prop"), max_retries)
                .await
                .unwrap();
            prop_assert!(result.success);
            prop_assert_eq!(result.retry_count, failures);
            prop_assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
            Ok(())
        })?;
    }

    #[test]
    fn stats_count_every_send(
        outcomes in prop::collection::vec(any::<bool>(), 1..30)
    ) {
        let rt = runtime();
        rt.block_on(async {
            let router = MessageRouter::new(RouterConfig::default());
            router.register_component("go-button", handler_fn(|m| {
                if m.data["ok"].as_bool().unwrap_or(false) {
                    Ok(json!(null))
                } else {
                    Err(Error::Runtime("rejected".to_string()))
                }
            }));

            for ok in &outcomes {
                router
                    .send(RouterMessage::new("BUTTON_PRESS", "prop").with_data(json!({"ok": ok})))
                    .await;
            }

            let stats = router.get_stats();
            let failures = outcomes.iter().filter(|ok| !**ok).count() as u64;
            prop_assert_eq!(stats.total_messages, outcomes.len() as u64);
            prop_assert_eq!(stats.error_count, failures);
            prop_assert!((0.0..=100.0).contains(&stats.success_rate));
            prop_assert_eq!(stats.priority_distribution.get("normal").copied(), Some(outcomes.len() as u64));
            Ok(())
        })?;
    }
}
