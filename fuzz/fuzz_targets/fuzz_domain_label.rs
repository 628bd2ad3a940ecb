//! Fuzz target: `DomainId::generate` on arbitrary labels.
//!
//! Accepted labels must round-trip through `label()`; rejected ones must
//! be empty, blank or contain control characters.

#![no_main]

use enclave_core::DomainId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(label) = std::str::from_utf8(data) else {
        return;
    };
    match DomainId::generate(label) {
        Ok(id) => {
            assert_eq!(id.label(), label, "label must be recoverable from the identity");
            assert!(id.as_str().starts_with(label));
        }
        Err(_) => assert!(label.trim().is_empty() || label.chars().any(char::is_control)),
    }
});
