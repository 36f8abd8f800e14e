//! Fuzz target for change-stream payload handling.
//!
//! Feeds arbitrary bytes through the JSON decoder and, when they decode,
//! through classification. Neither step may panic.

#![no_main]

use fixture_sync::subscription::{ClassificationRules, RawChange};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = serde_json::from_slice::<RawChange>(data) else {
        return;
    };

    let rules = ClassificationRules::default();
    if let Some(event) = rules.to_event(&raw) {
        assert!(!event.field_changes.is_empty());
        assert_eq!(event.timestamp, raw.commit_timestamp);
    }
});
