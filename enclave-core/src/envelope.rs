//! Boundary-safe representations of values and callables.
//!
//! An [`Envelope`] is created fresh for every marshal call and never
//! persisted. It either carries a directly transportable value as its serde
//! form, or a field-by-field breakdown of a value whose type has no native
//! boundary support.

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::MarshalError;
use crate::fault::Raised;
use crate::id::{MethodId, Signature, TypeTag};

/// A type-erased live value on one side of the boundary.
pub type AnyValue = Box<dyn Any + Send>;

/// Type-erased body of a direct callable.
pub type DirectFn = Arc<dyn Fn(Option<AnyValue>) -> Result<AnyValue, InvokeError> + Send + Sync>;

/// Type-erased body of a registered method, invoked against its target.
pub type MethodFn =
    Arc<
        dyn Fn(&mut (dyn Any + Send), Option<AnyValue>) -> Result<AnyValue, InvokeError>
            + Send
            + Sync,
    >;

/// Why invoking a type-erased callable did not produce a value.
#[derive(Debug)]
pub enum InvokeError {
    /// The work itself raised an error.
    Raised(Raised),
    /// The argument or target did not have the expected shape.
    Marshal(MarshalError),
}

impl From<MarshalError> for InvokeError {
    fn from(err: MarshalError) -> Self {
        Self::Marshal(err)
    }
}

/// Unpacks a type-erased argument into `S`.
///
/// # Errors
/// Returns [`MarshalError::UnexpectedVoid`] for a missing argument and
/// [`MarshalError::TypeMismatch`] if the argument is not an `S`.
pub fn unpack<S: Any>(arg: Option<AnyValue>) -> Result<S, MarshalError> {
    let arg = arg
        .ok_or_else(|| MarshalError::UnexpectedVoid { type_tag: type_name::<S>().to_owned() })?;
    arg.downcast::<S>()
        .map(|boxed| *boxed)
        .map_err(|_| MarshalError::TypeMismatch { expected: type_name::<S>().to_owned() })
}

/// The boundary-safe representation of one value.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Registered type of the wrapped value, required for reconstruction.
    pub declared_type: TypeTag,
    /// The value itself, or its field breakdown.
    pub payload: Payload,
}

/// Contents of an [`Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sentinel for an absent value; only the type tag is carried.
    Void,
    /// Serde form of a directly transportable value.
    Direct(serde_json::Value),
    /// Field name to nested representation, for types walked field by field.
    Fields(BTreeMap<String, FieldValue>),
}

/// One recorded field of a field-walked value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A nested value.
    Value(Envelope),
    /// A nested callable, routed through the callable marshaler.
    Callable(CallableEnvelope),
}

impl Envelope {
    /// Void envelope for an absent value of type `declared_type`.
    pub fn void(declared_type: impl Into<TypeTag>) -> Self {
        Self { declared_type: declared_type.into(), payload: Payload::Void }
    }

    /// Envelope carrying a directly transportable value.
    pub fn direct(declared_type: impl Into<TypeTag>, value: serde_json::Value) -> Self {
        Self { declared_type: declared_type.into(), payload: Payload::Direct(value) }
    }

    /// Envelope carrying a field breakdown.
    pub fn fields(declared_type: impl Into<TypeTag>, fields: BTreeMap<String, FieldValue>) -> Self {
        Self { declared_type: declared_type.into(), payload: Payload::Fields(fields) }
    }

    /// Whether the payload is the value's own serde form.
    #[must_use]
    pub fn is_directly_transportable(&self) -> bool {
        matches!(self.payload, Payload::Direct(_))
    }

    /// Whether this is the void sentinel.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self.payload, Payload::Void)
    }

    /// Looks up a recorded field of a field-walked envelope.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        match &self.payload {
            Payload::Fields(fields) => fields.get(name),
            Payload::Void | Payload::Direct(_) => None,
        }
    }
}

/// The boundary-safe representation of a callable.
#[derive(Clone)]
pub enum CallableEnvelope {
    /// The callable itself, transported whole. Its captured state is `Send`,
    /// so the platform moves it without help. Captures are shared, not copied.
    Direct { signature: Signature, delegate: DirectFn },
    /// A registered method plus the envelope of the target it is bound to.
    BoundMethod { signature: Signature, method: MethodId, target: Box<Envelope> },
    /// A closure plus an envelope of the state it reads, taken when the
    /// callable was marshaled.
    Captured {
        signature: Signature,
        delegate: MethodFn,
        state_name: &'static str,
        state: Box<Envelope>,
    },
}

impl CallableEnvelope {
    /// Shape of the wrapped callable.
    #[must_use]
    pub fn signature(&self) -> &Signature {
        match self {
            Self::Direct { signature, .. }
            | Self::BoundMethod { signature, .. }
            | Self::Captured { signature, .. } => signature,
        }
    }

    /// Whether the callable crosses whole rather than decomposed.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct { .. })
    }
}

impl fmt::Debug for CallableEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { signature, .. } => {
                f.debug_struct("Direct").field("signature", signature).finish_non_exhaustive()
            }
            Self::BoundMethod { signature, method, target } => f
                .debug_struct("BoundMethod")
                .field("signature", signature)
                .field("method", method)
                .field("target", target)
                .finish(),
            Self::Captured { signature, state, .. } => f
                .debug_struct("Captured")
                .field("signature", signature)
                .field("state", state)
                .finish_non_exhaustive(),
        }
    }
}

impl PartialEq for CallableEnvelope {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Direct { signature: a, delegate: da },
                Self::Direct { signature: b, delegate: db },
            ) => a == b && Arc::ptr_eq(da, db),
            (
                Self::BoundMethod { signature: a, method: ma, target: ta },
                Self::BoundMethod { signature: b, method: mb, target: tb },
            ) => a == b && ma == mb && ta == tb,
            (
                Self::Captured { signature: a, delegate: da, state: sa, .. },
                Self::Captured { signature: b, delegate: db, state: sb, .. },
            ) => a == b && Arc::ptr_eq(da, db) && sa == sb,
            _ => false,
        }
    }
}
