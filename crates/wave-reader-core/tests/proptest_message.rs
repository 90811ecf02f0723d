//! Property-based tests for message normalization and the factory.
//!
//! Validates:
//! 1. Normalized names are always lower-case
//! 2. A normalized message always has a non-empty `from`
//! 3. Nesting depth does not change the normalized result
//! 4. Factory construction preserves every non-envelope attribute

use proptest::prelude::*;
use serde_json::{Value, json};

use wave_reader_core::message::{Attributes, MessageFactory, MessageSender, names, normalize};

fn arb_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(names::START.to_string()),
        Just("STOP".to_string()),
        Just("Health-Check".to_string()),
        Just("LOOP_DETECTION_STATS".to_string()),
        "[A-Za-z_-]{1,20}",
    ]
}

fn arb_sender() -> impl Strategy<Value = MessageSender> {
    prop_oneof![
        Just(MessageSender::popup()),
        Just(MessageSender::default()),
        (1u32..500).prop_map(|id| MessageSender::content(id, "https://example.com")),
    ]
}

fn arb_extra() -> impl Strategy<Value = Attributes> {
    prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..6).prop_map(|map| {
        map.into_iter()
            .filter(|(k, _)| !matches!(k.as_str(), "name" | "from" | "timestamp" | "type" | "message" | "source"))
            .map(|(k, v)| (k, Value::from(v)))
            .collect()
    })
}

proptest! {
    #[test]
    fn names_are_lowercased(name in arb_name(), legacy in any::<bool>(), sender in arb_sender()) {
        let raw = if legacy { json!({"type": name}) } else { json!({"name": name}) };
        let attrs = normalize(raw, &sender);
        prop_assert_eq!(attrs["name"].as_str().unwrap(), name.to_lowercase());
    }

    #[test]
    fn from_is_never_empty(name in arb_name(), sender in arb_sender()) {
        let attrs = normalize(json!({"name": name, "from": ""}), &sender);
        let from = attrs["from"].as_str().unwrap();
        prop_assert!(!from.is_empty());
        prop_assert_eq!(from, sender.context());
    }

    #[test]
    fn nesting_depth_is_irrelevant(name in arb_name(), depth in 0usize..4, extra in arb_extra()) {
        let mut inner = extra.clone();
        inner.insert("name".to_string(), Value::String(name.clone()));
        let flat = normalize(Value::Object(inner.clone()), &MessageSender::popup());

        let mut nested = Value::Object(inner);
        for _ in 0..depth {
            nested = json!({"message": nested});
        }
        let unwrapped = normalize(nested, &MessageSender::popup());
        prop_assert_eq!(flat, unwrapped);
    }

    #[test]
    fn factory_keeps_attributes(name in arb_name(), extra in arb_extra()) {
        let message = MessageFactory::create_message(&name, "popup", extra.clone());
        prop_assert_eq!(&message.attributes, &extra);
        let value = message.to_value();
        for (key, v) in &extra {
            prop_assert_eq!(&value[key.as_str()], v);
        }
        prop_assert_eq!(value["from"].as_str(), Some("popup"));
    }
}
