use crate::id::{MethodId, Signature, TypeTag};

/// Errors produced by the `enclave-core` crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A domain label was empty, whitespace-only or contained control characters.
    #[error("invalid domain label {label:?}")]
    InvalidLabel { label: String },
}

/// A value could not be represented across, or rebuilt after, a domain boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MarshalError {
    /// The type is not registered in the catalog on this side of the boundary.
    #[error("type '{type_name}' cannot cross the boundary: {reason}")]
    UnsupportedType { type_name: String, reason: String },

    /// A rebuilt value did not have the Rust type the receiver asked for.
    #[error("expected a value of type '{expected}'")]
    TypeMismatch { expected: String },

    /// A field the reader requires was not present in the envelope.
    #[error("envelope of '{type_tag}' has no field '{field}'")]
    MissingField { type_tag: TypeTag, field: String },

    /// A void envelope was found where a value is required.
    #[error("envelope of '{type_tag}' is void")]
    UnexpectedVoid { type_tag: String },

    /// The object graph nests deeper than the configured limit.
    #[error("object graph nests deeper than {limit} levels")]
    DepthExceeded { limit: usize },

    /// A bound callable names a method the catalog does not have.
    #[error("method '{method}' is not loaded")]
    UnknownMethod { method: MethodId },

    /// A bound callable names a method registered with another shape.
    #[error("method '{method}' is registered as {found}, envelope expects {expected}")]
    SignatureMismatch { method: MethodId, expected: Signature, found: Signature },

    /// A callable with no bound action was asked to cross the boundary.
    #[error("callable has no bound action")]
    EmptyCallable,

    /// The serde codec of a directly transportable type failed to encode.
    #[error("failed to encode '{type_tag}': {reason}")]
    Encode { type_tag: TypeTag, reason: String },

    /// The serde codec of a directly transportable type failed to decode.
    #[error("failed to decode '{type_tag}': {reason}")]
    Decode { type_tag: TypeTag, reason: String },
}
