//! Isolation domains and the handles callers hold to them.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use enclave_core::{
    CallableEnvelope, DomainId, Envelope, InvocationRecord, InvocationStatus, Outcome,
};
use serde::{Deserialize, Serialize};

use crate::backend::ContextBackend;
use crate::context::{Population, SkippedUnit};
use crate::error::SandboxError;
use crate::thread::ThreadBackend;

/// Lifecycle of an isolation domain.
///
/// `Created -> Populated -> Ready -> Executing -> Ready -> ... -> Disposed`.
/// Nothing leaves `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainState {
    /// Identity assigned, no context yet.
    Created,
    /// Context running with its code units loaded.
    Populated,
    /// Registered and idle.
    Ready,
    /// Running an invocation.
    Executing,
    /// Removed from the registry and torn down.
    Disposed,
}

/// One isolated execution context and its bookkeeping.
pub struct IsolationDomain<B: ContextBackend> {
    identity: DomainId,
    created_at: DateTime<Utc>,
    population: Population,
    state: Mutex<DomainState>,
    // Held for the whole of an invocation, so invocations on one domain run
    // one at a time and teardown waits for the one in flight.
    context: tokio::sync::Mutex<Option<B::Context>>,
    backend: Arc<B>,
    last_invocation: Mutex<Option<InvocationRecord>>,
}

impl<B: ContextBackend> IsolationDomain<B> {
    /// A domain with an identity and no context, in [`DomainState::Created`].
    pub(crate) fn new(identity: DomainId, backend: Arc<B>) -> Self {
        Self {
            identity,
            created_at: Utc::now(),
            population: Population::default(),
            state: Mutex::new(DomainState::Created),
            context: tokio::sync::Mutex::new(None),
            backend,
            last_invocation: Mutex::new(None),
        }
    }

    /// Attach the spawned context and what was loaded into it.
    pub(crate) fn populate(&mut self, context: B::Context, population: Population) {
        self.population = population;
        *self.context.get_mut() = Some(context);
        *self.state.get_mut().unwrap_or_else(PoisonError::into_inner) = DomainState::Populated;
    }

    /// The domain's identity.
    #[must_use]
    pub fn identity(&self) -> &DomainId {
        &self.identity
    }

    /// The label the identity was generated from.
    #[must_use]
    pub fn label(&self) -> &str {
        self.identity.label()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Code units loaded into the context, in load order.
    #[must_use]
    pub fn loaded_units(&self) -> &[String] {
        &self.population.loaded
    }

    /// Code units that failed to load into the context.
    #[must_use]
    pub fn skipped_units(&self) -> &[SkippedUnit] {
        &self.population.skipped
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DomainState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the domain has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state() == DomainState::Disposed
    }

    /// Record of the most recent invocation.
    #[must_use]
    pub fn last_invocation(&self) -> Option<InvocationRecord> {
        self.last_invocation.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_state(&self, next: DomainState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Move to `next` only if currently in `from`.
    fn transition(&self, from: DomainState, next: DomainState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Run one invocation in the context and wait for its outcome.
    ///
    /// # Errors
    /// Returns [`SandboxError::UnknownDomain`] if the context is torn down,
    /// and whatever the backend reports for the invocation itself.
    pub(crate) async fn invoke(
        &self,
        callable: CallableEnvelope,
        state: Envelope,
    ) -> Result<Outcome, SandboxError> {
        let guard = self.context.lock().await;
        let Some(context) = guard.as_ref() else {
            return Err(SandboxError::UnknownDomain(self.identity.clone()));
        };

        self.transition(DomainState::Ready, DomainState::Executing);
        let _executing = ExecutingGuard(self);
        let started_at = Utc::now();
        let wall_start = Instant::now();

        let result = self.backend.invoke(context, callable, state).await;

        let status = match &result {
            Ok(outcome) => InvocationStatus::of(outcome),
            Err(e) => InvocationStatus::Failed { reason: e.to_string() },
        };
        tracing::debug!(
            domain = %self.identity,
            elapsed_ms = wall_start.elapsed().as_millis(),
            ?status,
            "invocation finished"
        );
        let record =
            InvocationRecord::new(self.identity.clone(), started_at, wall_start.elapsed(), status);
        *self.last_invocation.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
        result
    }

    /// Stop the context. Safe to call more than once.
    ///
    /// # Errors
    /// Propagates [`ContextBackend::terminate`] errors.
    pub(crate) async fn teardown(&self) -> Result<(), SandboxError> {
        let context = self.context.lock().await.take();
        self.set_state(DomainState::Disposed);
        match context {
            Some(context) => self.backend.terminate(context).await,
            None => Ok(()),
        }
    }
}

/// Returns an executing domain to `Ready` when the invocation ends, even if
/// its future is dropped part way.
struct ExecutingGuard<'d, B: ContextBackend>(&'d IsolationDomain<B>);

impl<B: ContextBackend> Drop for ExecutingGuard<'_, B> {
    fn drop(&mut self) {
        self.0.transition(DomainState::Executing, DomainState::Ready);
    }
}

impl<B: ContextBackend> fmt::Debug for IsolationDomain<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationDomain")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .field("loaded_units", &self.population.loaded)
            .finish_non_exhaustive()
    }
}

/// Caller-side handle to an isolation domain.
///
/// Cheap to clone; every clone refers to the same domain. Dropping a handle
/// does NOT dispose the domain. Call
/// [`Sandbox::dispose_domain`](crate::Sandbox::dispose_domain) explicitly.
pub struct DomainHandle<B: ContextBackend = ThreadBackend>(Arc<IsolationDomain<B>>);

impl<B: ContextBackend> DomainHandle<B> {
    pub(crate) fn new(domain: IsolationDomain<B>) -> Self {
        Self(Arc::new(domain))
    }

    /// Whether both handles refer to the same domain.
    #[must_use]
    pub fn same_domain(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<B: ContextBackend> Clone for DomainHandle<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: ContextBackend> Deref for DomainHandle<B> {
    type Target = IsolationDomain<B>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<B: ContextBackend> fmt::Debug for DomainHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DomainHandle").field(&self.0.identity).finish()
    }
}
