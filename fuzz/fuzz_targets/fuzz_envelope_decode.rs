//! Fuzz target: decoding untrusted envelopes against the core catalog.
//!
//! The first byte picks a declared type, the rest is parsed as the JSON
//! payload. Decoding must fail cleanly, never panic.

#![no_main]

use enclave_core::Envelope;
use enclave_executor::{Catalog, ObjectMarshaler};
use libfuzzer_sys::fuzz_target;

const TAGS: &[&str] = &[
    "unit", "bool", "char", "i8", "u64", "f32", "f64", "string", "bytes", "vec<i64>",
    "vec<string>", "json", "DivideByZero", "ArgumentError", "no-such-type",
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(rest) else {
        return;
    };
    let tag = TAGS[usize::from(selector) % TAGS.len()];

    let catalog = Catalog::new();
    let objects = ObjectMarshaler::new(&catalog);
    let envelope = Envelope::direct(tag, payload);

    // Anything that decodes must encode again under the same tag.
    if let Ok(Some(value)) = objects.from_envelope_dyn(&envelope) {
        let again = objects
            .to_envelope_dyn(&*value, tag)
            .expect("a decoded value must re-encode");
        assert_eq!(again.declared_type, envelope.declared_type);
    }
    let _ = objects.from_envelope_dyn(&Envelope::void(tag));
});
