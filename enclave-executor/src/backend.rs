//! Execution-context backend abstraction trait.
//!
//! Allows swapping how a domain's context is hosted (a dedicated thread
//! today) without changing the lifecycle logic in [`crate::domain`].

use async_trait::async_trait;
use enclave_core::{CallableEnvelope, DomainId, Envelope, Outcome};

use crate::catalog::CodeUnit;
use crate::config::DomainConfig;
use crate::context::Population;
use crate::error::SandboxError;

/// A freshly spawned context and the code units it ended up with.
#[derive(Debug)]
#[non_exhaustive]
pub struct Spawned<C> {
    /// The live context.
    pub context: C,
    /// Code units loaded and skipped while populating it.
    pub population: Population,
}

impl<C> Spawned<C> {
    #[must_use]
    pub fn new(context: C, population: Population) -> Self {
        Self { context, population }
    }
}

/// Hosts the execution contexts behind isolation domains.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
///
/// # Cancel Safety
/// `invoke` is not cancel safe: dropping its future does not stop work
/// already handed to the context.
#[async_trait]
pub trait ContextBackend: Send + Sync + 'static {
    /// Per-domain context state.
    type Context: Send + Sync + 'static;

    /// Start a context for `identity` and populate it with `units`.
    ///
    /// # Errors
    /// Returns [`SandboxError::SpawnFailed`] if the context cannot start.
    async fn spawn(
        &self,
        identity: &DomainId,
        units: &[CodeUnit],
        config: &DomainConfig,
    ) -> Result<Spawned<Self::Context>, SandboxError>;

    /// Run one invocation inside `context` and wait for its outcome.
    ///
    /// # Errors
    /// Returns [`SandboxError::Marshal`] if either leg cannot be rebuilt
    /// inside the context and [`SandboxError::ContextLost`] if the context
    /// stopped answering.
    async fn invoke(
        &self,
        context: &Self::Context,
        callable: CallableEnvelope,
        state: Envelope,
    ) -> Result<Outcome, SandboxError>;

    /// Stop `context` and release everything it holds.
    ///
    /// # Errors
    /// Returns [`SandboxError::ContextLost`] if the context died abnormally.
    async fn terminate(&self, context: Self::Context) -> Result<(), SandboxError>;
}
