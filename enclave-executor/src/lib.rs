//! Isolation domains for the enclave sandbox.
//!
//! Runs units of work inside isolated execution contexts, each with its own
//! catalog of loaded types, and carries arguments, results and faults across
//! the boundary by marshaling.
//!
//! ```no_run
//! # async fn demo() -> Result<(), enclave_executor::SandboxError> {
//! use enclave_executor::{execute_in_domain, Callable};
//!
//! let inc = Callable::new(|n: i64| n + 1);
//! let answer: i64 = execute_in_domain("worker", &inc, &41_i64).await?;
//! assert_eq!(answer, 42);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod callable;
pub mod catalog;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod fault;
pub mod marshal;
pub mod registry;
pub mod sandbox;
pub mod thread;

pub use backend::{ContextBackend, Spawned};
pub use callable::{Callable, CallableMarshaler};
pub use catalog::{Catalog, CodeUnit};
pub use config::{DomainConfig, DEFAULT_MAX_DEPTH};
pub use context::{Population, SkippedUnit};
pub use domain::{DomainHandle, DomainState, IsolationDomain};
pub use error::{CatalogError, SandboxError};
pub use fault::FaultEnvelope;
pub use marshal::{FieldReader, FieldWriter, Marshalable, ObjectMarshaler};
pub use registry::DomainRegistry;
pub use sandbox::{create_domain, dispose_domain, execute_in_domain, load_unit, Sandbox};
pub use thread::{ThreadBackend, ThreadContext};
