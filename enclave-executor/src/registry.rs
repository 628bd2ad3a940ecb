//! Registry of live isolation domains.
//!
//! Tracks which handles are live and serializes inserts and removals under
//! one lock. Execution itself never takes this lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use enclave_core::DomainId;

use crate::backend::ContextBackend;
use crate::domain::{DomainHandle, DomainState};
use crate::error::SandboxError;

/// Maps each live domain's identity to its handle.
pub struct DomainRegistry<B: ContextBackend> {
    domains: Mutex<HashMap<DomainId, DomainHandle<B>>>,
}

impl<B: ContextBackend> DomainRegistry<B> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { domains: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DomainId, DomainHandle<B>>> {
        self.domains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handle` under its identity.
    ///
    /// # Errors
    /// Returns [`SandboxError::DuplicateDomain`] if the identity is taken.
    pub(crate) fn insert(&self, handle: DomainHandle<B>) -> Result<(), SandboxError> {
        let mut domains = self.lock();
        if domains.contains_key(handle.identity()) {
            return Err(SandboxError::DuplicateDomain(handle.identity().clone()));
        }
        domains.insert(handle.identity().clone(), handle);
        Ok(())
    }

    /// Remove the entry for `identity`, returning its handle.
    ///
    /// This is bookkeeping only: the domain's context keeps running. Use
    /// [`Sandbox::dispose_domain`](crate::Sandbox::dispose_domain) to tear
    /// a domain down.
    pub fn remove(&self, identity: &DomainId) -> Option<DomainHandle<B>> {
        self.lock().remove(identity)
    }

    /// Remove `handle` and mark it disposed, atomically with respect to
    /// other registry operations.
    ///
    /// Returns `Ok(true)` if this call removed it and `Ok(false)` if it was
    /// already disposed.
    ///
    /// # Errors
    /// Returns [`SandboxError::UnknownDomain`] if `handle` was never
    /// registered here.
    pub(crate) fn retire(&self, handle: &DomainHandle<B>) -> Result<bool, SandboxError> {
        let mut domains = self.lock();
        match domains.get(handle.identity()) {
            Some(registered) if registered.same_domain(handle) => {
                domains.remove(handle.identity());
                handle.set_state(DomainState::Disposed);
                Ok(true)
            }
            _ if handle.is_disposed() => Ok(false),
            _ => Err(SandboxError::UnknownDomain(handle.identity().clone())),
        }
    }

    /// Whether `handle` is registered here.
    #[must_use]
    pub fn contains(&self, handle: &DomainHandle<B>) -> bool {
        self.lock().get(handle.identity()).is_some_and(|registered| registered.same_domain(handle))
    }

    /// Handle of the live domain with `identity`.
    #[must_use]
    pub fn get(&self, identity: &DomainId) -> Option<DomainHandle<B>> {
        self.lock().get(identity).cloned()
    }

    /// Number of live domains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no domains are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Identities of all live domains, sorted.
    #[must_use]
    pub fn identities(&self) -> Vec<DomainId> {
        let mut identities: Vec<_> = self.lock().keys().cloned().collect();
        identities.sort_unstable();
        identities
    }
}

impl<B: ContextBackend> Default for DomainRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use enclave_core::{CallableEnvelope, Envelope, Outcome};

    use super::*;
    use crate::backend::Spawned;
    use crate::catalog::CodeUnit;
    use crate::config::DomainConfig;
    use crate::context::Population;
    use crate::domain::IsolationDomain;

    struct NullBackend;

    #[async_trait]
    impl ContextBackend for NullBackend {
        type Context = ();

        async fn spawn(
            &self,
            _identity: &DomainId,
            _units: &[CodeUnit],
            _config: &DomainConfig,
        ) -> Result<Spawned<()>, SandboxError> {
            Err(SandboxError::SpawnFailed("mock".to_owned()))
        }

        async fn invoke(
            &self,
            _context: &(),
            _callable: CallableEnvelope,
            _state: Envelope,
        ) -> Result<Outcome, SandboxError> {
            Err(SandboxError::SpawnFailed("mock".to_owned()))
        }

        async fn terminate(&self, _context: ()) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn handle(label: &str) -> DomainHandle<NullBackend> {
        let identity = DomainId::generate(label).expect("valid label");
        let mut domain = IsolationDomain::new(identity, Arc::new(NullBackend));
        domain.populate((), Population::default());
        DomainHandle::new(domain)
    }

    #[test]
    fn registry_starts_empty() {
        let registry = DomainRegistry::<NullBackend>::new();
        assert!(registry.is_empty(), "new registry must have zero live domains");
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn insert_rejects_colliding_identity() {
        let registry = DomainRegistry::new();
        let a = handle("worker");
        registry.insert(a.clone()).expect("first insert");
        assert!(matches!(registry.insert(a.clone()), Err(SandboxError::DuplicateDomain(_))));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&a));
        assert!(registry.get(a.identity()).is_some_and(|h| h.same_domain(&a)));
    }

    #[test]
    fn retire_is_idempotent() {
        let registry = DomainRegistry::new();
        let a = handle("worker");
        registry.insert(a.clone()).expect("insert");
        assert_eq!(registry.retire(&a).ok(), Some(true));
        assert!(a.is_disposed());
        assert_eq!(registry.retire(&a).ok(), Some(false), "second retire must be a no-op");
        assert!(registry.is_empty());
    }

    #[test]
    fn retire_of_unregistered_handle_is_unknown() {
        let registry = DomainRegistry::new();
        let stranger = handle("stranger");
        assert!(matches!(registry.retire(&stranger), Err(SandboxError::UnknownDomain(_))));
    }

    #[test]
    fn remove_returns_the_handle() {
        let registry = DomainRegistry::new();
        let a = handle("worker");
        registry.insert(a.clone()).expect("insert");
        assert!(registry.remove(a.identity()).is_some_and(|h| h.same_domain(&a)));
        assert!(registry.remove(a.identity()).is_none());
    }

    #[test]
    fn identities_are_sorted() {
        let registry = DomainRegistry::new();
        for label in ["b", "a", "c"] {
            registry.insert(handle(label)).expect("insert");
        }
        let labels: Vec<_> = registry.identities().iter().map(|id| id.label().to_owned()).collect();
        assert_eq!(labels, ["a", "b", "c"]);
    }
}
