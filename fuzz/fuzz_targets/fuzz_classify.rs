//! Fuzz target for error classification.
//!
//! Classification runs on arbitrary upstream error text, so it must never
//! panic and must keep the retry rules consistent.

#![no_main]

use fixture_sync::classifier::{classify_message, ErrorCategory, OperationContext};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, Option<u16>)| {
    let (message, status) = data;
    let mut context = OperationContext::new("fuzz");
    if let Some(status) = status {
        context = context.with_status(status);
    }

    let classified = classify_message(message, &context);

    match classified.category {
        ErrorCategory::Authentication | ErrorCategory::DataValidation | ErrorCategory::Unknown => {
            assert!(!classified.retryable)
        }
        ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::RateLimit => assert!(classified.retryable),
        _ => {}
    }
});
