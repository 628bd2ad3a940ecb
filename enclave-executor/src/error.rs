//! Error types for the executor crate.

use enclave_core::{CoreError, DomainId, IsolatedFault, MarshalError, MethodId, TypeTag};

/// Errors that can occur while registering types, methods or code units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// A type with this tag or Rust type is already registered.
    #[error("type '{tag}' is already registered")]
    DuplicateType { tag: TypeTag },

    /// A method with this identifier is already registered.
    #[error("method '{method}' is already registered")]
    DuplicateMethod { method: MethodId },

    /// A code unit with this name is already loaded.
    #[error("code unit '{unit}' is already loaded")]
    DuplicateUnit { unit: String },

    /// A method target or fault type was registered before its type.
    #[error("type '{type_name}' must be registered first")]
    UnregisteredType { type_name: String },

    /// A code unit declined to load in this context.
    #[error("code unit unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors that can occur during isolation-domain lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The caller supplied no usable domain label.
    #[error("invalid domain label {label:?}")]
    InvalidLabel { label: String },

    /// A value could not be represented across the boundary.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// An invocation was requested with no bound unit of work.
    #[error("no callable bound to the invocation")]
    MissingCallable,

    /// The handle is not registered with this sandbox.
    #[error("unknown isolation domain: {0}")]
    UnknownDomain(DomainId),

    /// The work raised inside the domain; the fault is rebuilt here.
    #[error(transparent)]
    Isolated(#[from] IsolatedFault),

    /// A generated identity collided with a live domain.
    #[error("domain identity already registered: {0}")]
    DuplicateDomain(DomainId),

    /// A code unit named in `required_units` did not load in the new context.
    #[error("required code unit '{unit}' failed to load: {reason}")]
    UnitLoadFailed { unit: String, reason: String },

    /// Registering into a catalog failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The execution context could not be started.
    #[error("execution context spawn failed: {0}")]
    SpawnFailed(String),

    /// The execution context stopped answering.
    #[error("execution context of {0} is gone")]
    ContextLost(DomainId),
}

impl SandboxError {
    /// Whether a value's type could not cross the boundary.
    #[must_use]
    pub fn is_unsupported_type(&self) -> bool {
        matches!(self, Self::Marshal(MarshalError::UnsupportedType { .. }))
    }

    /// The rebuilt isolated fault, if this error is one.
    #[must_use]
    pub fn as_isolated(&self) -> Option<&IsolatedFault> {
        match self {
            Self::Isolated(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<CoreError> for SandboxError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidLabel { label } => Self::InvalidLabel { label },
            other => Self::SpawnFailed(other.to_string()),
        }
    }
}
