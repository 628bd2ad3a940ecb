//! Boundary data model for the enclave isolated-execution sandbox.
//!
//! Defines what crosses an isolation-domain boundary: value envelopes,
//! callable envelopes, fault records, and the identities that name domains,
//! types and methods. Behaviour lives in `enclave-executor`.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod envelope;
pub mod error;
pub mod fault;
pub mod id;
pub mod outcome;

pub use envelope::{
    unpack, AnyValue, CallableEnvelope, DirectFn, Envelope, FieldValue, InvokeError, MethodFn,
    Payload,
};
pub use error::{CoreError, MarshalError};
pub use fault::{
    ArgumentError, BoxError, DivideByZero, FaultRecord, InvalidOperation, IsolatedFault, Panicked,
    Raised, RemoteFault,
};
pub use id::{DomainId, MethodId, Signature, TypeTag};
pub use outcome::{InvocationRecord, InvocationStatus, Outcome};

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::error::Error;

    use super::*;

    fn record(tag: &str, message: &str, cause: Option<FaultRecord>) -> FaultRecord {
        FaultRecord {
            type_tag: TypeTag::new(tag),
            qualified_name: format!("app::{tag}"),
            message: message.to_owned(),
            stack_trace: "0: app::work".to_owned(),
            detail: None,
            cause: cause.map(Box::new),
        }
    }

    #[test]
    fn domain_id_carries_label_and_suffix() {
        let id = match DomainId::generate("worker") {
            Ok(id) => id,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert!(id.as_str().starts_with("worker_"), "identity must start with the label, got {id}");
        assert_eq!(id.as_str().len(), "worker_".len() + 12, "suffix must be 12 hex digits");
        assert_eq!(id.label(), "worker");
    }

    #[test]
    fn domain_id_label_keeps_inner_underscores() {
        let id = DomainId::generate("batch_job").expect("valid label");
        assert_eq!(id.label(), "batch_job");
    }

    #[test]
    fn domain_id_rejects_blank_and_control_labels() {
        for label in ["", "   ", "\t", "bad\0label", "line\nbreak"] {
            assert!(
                matches!(DomainId::generate(label), Err(CoreError::InvalidLabel { .. })),
                "label {label:?} must be rejected"
            );
        }
    }

    #[test]
    fn domain_ids_for_same_label_differ() {
        let a = DomainId::generate("worker").expect("valid label");
        let b = DomainId::generate("worker").expect("valid label");
        assert_ne!(a, b, "two identities for one label must not collide");
    }

    #[test]
    fn signature_display_shows_shape() {
        let sig = Signature::of::<i64, String>();
        assert_eq!(sig.to_string(), "fn(i64) -> alloc::string::String");
    }

    #[test]
    fn envelope_predicates_follow_payload() {
        let void = Envelope::void("i64");
        assert!(void.is_void());
        assert!(!void.is_directly_transportable());

        let direct = Envelope::direct("i64", serde_json::json!(7));
        assert!(direct.is_directly_transportable());
        assert!(direct.field("x").is_none());

        let mut fields = BTreeMap::new();
        fields.insert("x".to_owned(), FieldValue::Value(direct.clone()));
        let walked = Envelope::fields("point", fields);
        assert!(!walked.is_directly_transportable());
        assert_eq!(walked.field("x"), Some(&FieldValue::Value(direct)));
    }

    #[test]
    fn unpack_reports_void_and_mismatch() {
        assert!(matches!(unpack::<i64>(None), Err(MarshalError::UnexpectedVoid { .. })));
        let wrong: AnyValue = Box::new("text".to_owned());
        assert!(matches!(unpack::<i64>(Some(wrong)), Err(MarshalError::TypeMismatch { .. })));
        let right: AnyValue = Box::new(5_i64);
        assert_eq!(unpack::<i64>(Some(right)).ok(), Some(5));
    }

    #[test]
    fn same_fault_compares_type_message_and_causes() {
        let a = record("Io", "disk full", Some(record("Os", "ENOSPC", None)));
        let mut b = a.clone();
        b.stack_trace = "different trace".to_owned();
        assert!(a.same_fault(&b), "stack trace must not affect fault identity");

        let c = record("Io", "disk full", Some(record("Os", "EIO", None)));
        assert!(!a.same_fault(&c), "different cause must break fault identity");

        let d = record("Io", "disk full", None);
        assert!(!a.same_fault(&d), "missing cause must break fault identity");
    }

    #[test]
    fn chain_walks_outermost_first() {
        let r = record("Outer", "o", Some(record("Mid", "m", Some(record("Inner", "i", None)))));
        let tags: Vec<_> = r.chain().map(|c| c.type_tag.as_str().to_owned()).collect();
        assert_eq!(tags, ["Outer", "Mid", "Inner"]);
    }

    #[test]
    fn remote_fault_reports_captured_text_and_causes() {
        let r = record("Io", "disk full", Some(record("Os", "ENOSPC", None)));
        let remote = RemoteFault::from_record(&r);
        assert_eq!(remote.to_string(), "disk full");
        assert_eq!(remote.stack_trace(), "0: app::work");
        assert_eq!(remote.type_tag().as_str(), "Io");
        let source = remote.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("ENOSPC"));
    }

    #[test]
    fn isolated_fault_display_includes_qualified_name() {
        let r = record("DivideByZero", "attempted to divide by zero", None);
        let fault = IsolatedFault::new(r, Box::new(DivideByZero));
        assert_eq!(fault.type_name(), "DivideByZero");
        assert!(fault.to_string().contains("app::DivideByZero"));
        assert!(fault.is::<DivideByZero>());
        assert_eq!(fault.downcast_ref::<DivideByZero>(), Some(&DivideByZero));
    }

    #[test]
    fn raised_remembers_static_type() {
        let err = ArgumentError { param: "x".to_owned(), reason: "negative".to_owned() };
        let raised = Raised::new(err);
        assert!(raised.raised_as.ends_with("ArgumentError"));
        assert_eq!(raised.error.to_string(), "invalid argument 'x': negative");
    }

    #[test]
    fn invocation_status_of_outcome() {
        let returned = Outcome::Returned(Envelope::direct("unit", serde_json::Value::Null));
        assert_eq!(InvocationStatus::of(&returned), InvocationStatus::Returned);
        let faulted = Outcome::Faulted(record("DivideByZero", "x", None));
        assert_eq!(
            InvocationStatus::of(&faulted),
            InvocationStatus::Faulted { type_tag: TypeTag::new("DivideByZero") }
        );
    }

    proptest::proptest! {
        #[test]
        fn proptest_identity_prefix_is_label(label in "[a-zA-Z][a-zA-Z0-9 _-]{0,24}") {
            let id = DomainId::generate(&label).expect("generated labels are valid");
            let prefix = format!("{label}_");
            proptest::prop_assert!(id.as_str().starts_with(&prefix));
            proptest::prop_assert_eq!(id.label(), label.as_str());
        }
    }
}
