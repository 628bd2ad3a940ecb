//! Fault records and the errors rebuilt from them.
//!
//! A [`FaultRecord`] is the boundary-safe capture of an error raised inside an
//! isolation domain. Message and stack trace are frozen to text at capture
//! time so they survive the teardown of the context that raised them.

use std::any::type_name;
use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::id::TypeTag;

/// Owned, thread-safe error as raised by a unit of work.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error raised by a unit of work together with the static type it was
/// raised as.
#[derive(Debug)]
pub struct Raised {
    /// The error value.
    pub error: BoxError,
    /// `std::any::type_name` of the raised type, before boxing.
    pub raised_as: &'static str,
}

impl Raised {
    /// Boxes `error`, remembering its static type name.
    pub fn new<E: Into<BoxError> + 'static>(error: E) -> Self {
        Self { raised_as: type_name::<E>(), error: error.into() }
    }
}

/// Boundary-safe capture of a raised error.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    /// Registered tag of the error type, or its short Rust name if unregistered.
    pub type_tag: TypeTag,
    /// Fully-qualified Rust type name.
    pub qualified_name: String,
    /// The error's `Display` text.
    pub message: String,
    /// Point-in-time stack trace text.
    pub stack_trace: String,
    /// The error value itself: carried whole when its type is directly
    /// transportable, field-walked otherwise, absent when unregistered.
    pub detail: Option<Envelope>,
    /// Capture of the error's `source()`, if any.
    pub cause: Option<Box<FaultRecord>>,
}

impl FaultRecord {
    /// Whether `other` records the same underlying fault: same type, same
    /// message, and the same cause chain.
    #[must_use]
    pub fn same_fault(&self, other: &FaultRecord) -> bool {
        self.type_tag == other.type_tag
            && self.message == other.message
            && match (&self.cause, &other.cause) {
                (Some(a), Some(b)) => a.same_fault(b),
                (None, None) => true,
                _ => false,
            }
    }

    /// Iterates this record followed by its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &FaultRecord> {
        std::iter::successors(Some(self), |record| record.cause.as_deref())
    }
}

/// An error raised inside an isolation domain, rebuilt on the caller side.
///
/// `Display` renders `<qualified type name>: <message>`. The rebuilt error is
/// reachable through [`IsolatedFault::downcast_ref`] and `source()`.
#[derive(Debug)]
pub struct IsolatedFault {
    record: FaultRecord,
    error: BoxError,
}

impl IsolatedFault {
    /// Pairs a captured record with the error rebuilt from it.
    #[must_use]
    pub fn new(record: FaultRecord, error: BoxError) -> Self {
        Self { record, error }
    }

    /// Reported type name (the registered tag).
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.record.type_tag.as_str()
    }

    /// Fully-qualified Rust type name of the original error.
    #[must_use]
    pub fn qualified_name(&self) -> &str {
        &self.record.qualified_name
    }

    /// Message of the original error.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.record.message
    }

    /// Stack trace captured inside the domain.
    #[must_use]
    pub fn stack_trace(&self) -> &str {
        &self.record.stack_trace
    }

    /// The captured record.
    #[must_use]
    pub fn record(&self) -> &FaultRecord {
        &self.record
    }

    /// The rebuilt error, if it is an `E`.
    #[must_use]
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }

    /// Whether the rebuilt error is an `E`.
    #[must_use]
    pub fn is<E: Error + 'static>(&self) -> bool {
        self.error.is::<E>()
    }

    /// Consumes the fault, returning the rebuilt error.
    #[must_use]
    pub fn into_inner(self) -> BoxError {
        self.error
    }
}

impl fmt::Display for IsolatedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.record.qualified_name, self.record.message)
    }
}

impl Error for IsolatedFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Fallback reconstruction of an error whose type is not registered on the
/// caller side. Message and stack trace report the captured text.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFault {
    type_tag: TypeTag,
    qualified_name: String,
    message: String,
    stack_trace: String,
    fields: Option<Envelope>,
    cause: Option<Box<RemoteFault>>,
}

impl RemoteFault {
    /// Rebuilds the fallback representation of `record` and its causes.
    #[must_use]
    pub fn from_record(record: &FaultRecord) -> Self {
        Self {
            type_tag: record.type_tag.clone(),
            qualified_name: record.qualified_name.clone(),
            message: record.message.clone(),
            stack_trace: record.stack_trace.clone(),
            fields: record.detail.clone(),
            cause: record.cause.as_deref().map(|cause| Box::new(Self::from_record(cause))),
        }
    }

    /// Reported type name.
    #[must_use]
    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    /// Fully-qualified Rust type name of the original error.
    #[must_use]
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Captured message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Captured stack trace.
    #[must_use]
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }

    /// Captured representation of the original error value, if any.
    #[must_use]
    pub fn fields(&self) -> Option<&Envelope> {
        self.fields.as_ref()
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for RemoteFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Integer or rational division by zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("attempted to divide by zero")]
pub struct DivideByZero;

/// An argument was outside the domain of the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("invalid argument '{param}': {reason}")]
pub struct ArgumentError {
    /// Name of the offending parameter.
    pub param: String,
    /// What was wrong with it.
    pub reason: String,
}

/// The operation is not valid in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("invalid operation: {0}")]
pub struct InvalidOperation(pub String);

/// The work panicked; the panic was contained inside the domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("isolated work panicked: {message}")]
pub struct Panicked {
    /// The panic payload, when it was a string.
    pub message: String,
}
