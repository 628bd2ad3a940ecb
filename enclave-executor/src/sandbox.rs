//! The caller-facing sandbox: host catalog, code units, and the
//! create / invoke / dispose lifecycle of isolation domains.

use std::any::{type_name, Any};
use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard};

use enclave_core::{
    CallableEnvelope, DomainId, Envelope, MarshalError, MethodId, Outcome, Signature,
};

use crate::backend::{ContextBackend, Spawned};
use crate::callable::{Callable, CallableMarshaler};
use crate::catalog::{Catalog, CodeUnit};
use crate::config::DomainConfig;
use crate::domain::{DomainHandle, DomainState, IsolationDomain};
use crate::error::{CatalogError, SandboxError};
use crate::fault::FaultEnvelope;
use crate::marshal::ObjectMarshaler;
use crate::registry::DomainRegistry;
use crate::thread::ThreadBackend;

/// Code units loaded on the caller side, and the catalog they produced.
struct Host {
    units: Vec<CodeUnit>,
    catalog: Catalog,
}

/// Creates isolation domains, runs work in them, and disposes them.
///
/// The calling task is suspended until an invocation completes. Dropping an
/// [`Sandbox::execute_in_domain`] future part way still disposes its domain;
/// the work already running in it finishes first.
pub struct Sandbox<B: ContextBackend = ThreadBackend> {
    host: RwLock<Host>,
    backend: Arc<B>,
    registry: DomainRegistry<B>,
    config: DomainConfig,
}

impl Sandbox<ThreadBackend> {
    /// A sandbox with the thread backend and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(ThreadBackend::new(), DomainConfig::default())
    }

    /// A sandbox with the thread backend and the given configuration.
    #[must_use]
    pub fn with_config(config: DomainConfig) -> Self {
        Self::with_backend(ThreadBackend::new(), config)
    }

    /// The process-wide sandbox behind the free functions of this crate.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Sandbox> = OnceLock::new();
        GLOBAL.get_or_init(Sandbox::new)
    }
}

impl Default for Sandbox<ThreadBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ContextBackend> Sandbox<B> {
    /// A sandbox hosting its contexts on `backend`.
    #[must_use]
    pub fn with_backend(backend: B, config: DomainConfig) -> Self {
        Self {
            host: RwLock::new(Host { units: Vec::new(), catalog: Catalog::new() }),
            backend: Arc::new(backend),
            registry: DomainRegistry::new(),
            config,
        }
    }

    /// The registry of live domains.
    #[must_use]
    pub fn registry(&self) -> &DomainRegistry<B> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    fn host(&self) -> RwLockReadGuard<'_, Host> {
        self.host.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load `unit` on the caller side. Every domain created afterwards
    /// replays it into its own catalog.
    ///
    /// # Errors
    /// Returns [`CatalogError::DuplicateUnit`] if a unit with the same name is
    /// loaded, or whatever the loader returns. A failed load changes nothing.
    pub fn load_unit(&self, unit: CodeUnit) -> Result<(), SandboxError> {
        let mut host = self.host.write().unwrap_or_else(PoisonError::into_inner);
        if host.units.iter().any(|loaded| loaded.name() == unit.name()) {
            return Err(CatalogError::DuplicateUnit { unit: unit.name().to_owned() }.into());
        }
        let mut staged = host.catalog.clone();
        unit.load_into(&mut staged)?;
        host.catalog = staged;
        tracing::info!(unit = unit.name(), "code unit loaded");
        host.units.push(unit);
        Ok(())
    }

    /// Names of the code units loaded on the caller side, in load order.
    #[must_use]
    pub fn loaded_units(&self) -> Vec<String> {
        self.host().units.iter().map(|unit| unit.name().to_owned()).collect()
    }

    /// Run `f` against the caller-side catalog.
    pub fn with_catalog<R>(&self, f: impl FnOnce(&Catalog) -> R) -> R {
        f(&self.host().catalog)
    }

    /// Bind a registered method to `target`.
    ///
    /// # Errors
    /// Returns [`MarshalError::UnknownMethod`] or
    /// [`MarshalError::TypeMismatch`] as [`Catalog::bind`] does.
    pub fn bind<T: Any + Send>(
        &self,
        target: T,
        method: impl Into<MethodId>,
    ) -> Result<Callable, SandboxError> {
        Ok(self.host().catalog.bind(target, method)?)
    }

    /// Create an isolation domain for `label`.
    ///
    /// Every loaded code unit is replayed into the new context; units that
    /// fail are skipped unless listed in [`DomainConfig::required_units`].
    /// On failure the partly built context is torn down and nothing is
    /// registered.
    ///
    /// # Errors
    /// Returns [`SandboxError::InvalidLabel`] for an empty or malformed label,
    /// [`SandboxError::UnitLoadFailed`] if a required unit did not load, and
    /// backend spawn errors.
    pub async fn create_domain(&self, label: &str) -> Result<DomainHandle<B>, SandboxError> {
        let identity = DomainId::generate(label)?;
        let units = self.host().units.clone();
        let mut domain = IsolationDomain::new(identity, Arc::clone(&self.backend));

        let Spawned { context, population, .. } =
            self.backend.spawn(domain.identity(), &units, &self.config).await?;

        let missing = self
            .config
            .required_units
            .iter()
            .find(|unit| !population.loaded.iter().any(|loaded| loaded == *unit));
        if let Some(unit) = missing {
            let reason =
                population.skip_reason(unit).unwrap_or("not loaded on the host").to_owned();
            self.discard(domain.identity(), context).await;
            return Err(SandboxError::UnitLoadFailed { unit: unit.clone(), reason });
        }

        domain.populate(context, population);
        let handle = DomainHandle::new(domain);
        handle.set_state(DomainState::Ready);
        if let Err(e) = self.registry.insert(handle.clone()) {
            if let Err(teardown) = handle.teardown().await {
                tracing::warn!(
                    domain = %handle.identity(),
                    error = %teardown,
                    "teardown after failed insert"
                );
            }
            return Err(e);
        }

        tracing::info!(
            domain = %handle.identity(),
            loaded = handle.loaded_units().len(),
            skipped = handle.skipped_units().len(),
            "isolation domain created"
        );
        Ok(handle)
    }

    /// Run `callable` on `state` inside the domain behind `handle`.
    ///
    /// `callable` and `state` are marshaled before this returns, so the
    /// future holds neither.
    ///
    /// # Errors
    /// Returns [`SandboxError::MissingCallable`] for an empty callable,
    /// [`MarshalError::TypeMismatch`] if the callable does not take `S` or
    /// return `R`, [`SandboxError::UnknownDomain`] if `handle` is not live here,
    /// [`SandboxError::Marshal`] if a value cannot cross, and
    /// [`SandboxError::Isolated`] carrying the rebuilt error if the work
    /// raised or panicked.
    pub fn invoke<'a, S: Any, R: Any>(
        &'a self,
        handle: &'a DomainHandle<B>,
        callable: &Callable,
        state: &S,
    ) -> impl Future<Output = Result<R, SandboxError>> + Send + 'a {
        let call = self.invoke_opt::<S, R>(handle, callable, Some(state));
        async move { call.await?.ok_or_else(|| void_result::<R>()) }
    }

    /// [`Sandbox::invoke`] with state and result that may be absent.
    ///
    /// # Errors
    /// As [`Sandbox::invoke`].
    pub fn invoke_opt<'a, S: Any, R: Any>(
        &'a self,
        handle: &'a DomainHandle<B>,
        callable: &Callable,
        state: Option<&S>,
    ) -> impl Future<Output = Result<Option<R>, SandboxError>> + Send + 'a {
        let prepared = self.marshal_call::<S, R>(callable, state).and_then(|call| {
            if self.registry.contains(handle) {
                Ok(call)
            } else {
                Err(SandboxError::UnknownDomain(handle.identity().clone()))
            }
        });
        async move {
            let (callable, state) = prepared?;
            let outcome = handle.invoke(callable, state).await?;
            self.settle(outcome)
        }
    }

    /// Dispose the domain behind `handle`: remove it from the registry, then
    /// tear its context down. Disposing an already-disposed handle is a no-op.
    ///
    /// # Errors
    /// Returns [`SandboxError::UnknownDomain`] if `handle` was never
    /// registered with this sandbox, and backend teardown errors.
    pub async fn dispose_domain(&self, handle: &DomainHandle<B>) -> Result<(), SandboxError> {
        if !self.registry.retire(handle)? {
            tracing::debug!(domain = %handle.identity(), "domain already disposed");
            return Ok(());
        }
        handle.teardown().await?;
        tracing::info!(domain = %handle.identity(), "isolation domain disposed");
        Ok(())
    }

    /// Create a domain for `label`, run `callable` on `state` in it, and
    /// dispose it whatever happened.
    ///
    /// An error raised by the work is rebuilt here and returned as
    /// [`SandboxError::Isolated`], after the domain is gone. If the returned
    /// future is dropped before it completes, the domain is still removed
    /// from the registry and torn down in the background.
    ///
    /// # Errors
    /// As [`Sandbox::create_domain`] and [`Sandbox::invoke`].
    pub fn execute_in_domain<'a, S: Any, R: Any>(
        &'a self,
        label: &'a str,
        callable: &Callable,
        state: &S,
    ) -> impl Future<Output = Result<R, SandboxError>> + Send + 'a {
        let run = self.execute_in_domain_opt::<S, R>(label, callable, Some(state));
        async move { run.await?.ok_or_else(|| void_result::<R>()) }
    }

    /// [`Sandbox::execute_in_domain`] with state and result that may be absent.
    ///
    /// # Errors
    /// As [`Sandbox::execute_in_domain`].
    pub fn execute_in_domain_opt<'a, S: Any, R: Any>(
        &'a self,
        label: &'a str,
        callable: &Callable,
        state: Option<&S>,
    ) -> impl Future<Output = Result<Option<R>, SandboxError>> + Send + 'a {
        let prepared = self.marshal_call::<S, R>(callable, state);
        async move {
            let (callable, state) = prepared?;
            let handle = self.create_domain(label).await?;
            let guard = DisposeOnDrop { registry: &self.registry, handle: Some(handle.clone()) };
            let invoked = handle.invoke(callable, state).await;
            let disposed = self.dispose_domain(&handle).await;
            guard.disarm();
            match (invoked, disposed) {
                (Ok(outcome), Ok(())) => self.settle(outcome),
                (Ok(_), Err(e)) => Err(e),
                (Err(e), disposed) => {
                    if let Err(teardown) = disposed {
                        tracing::warn!(
                            domain = %handle.identity(),
                            error = %teardown,
                            "dispose after failed invocation"
                        );
                    }
                    Err(e)
                }
            }
        }
    }

    fn marshaler<'c>(&self, catalog: &'c Catalog) -> ObjectMarshaler<'c> {
        ObjectMarshaler::new(catalog).with_max_depth(self.config.max_depth)
    }

    fn marshal_call<S: Any, R: Any>(
        &self,
        callable: &Callable,
        state: Option<&S>,
    ) -> Result<(CallableEnvelope, Envelope), SandboxError> {
        let Some(signature) = callable.signature() else {
            return Err(SandboxError::MissingCallable);
        };
        check_signature::<S, R>(signature)?;
        let host = self.host();
        let objects = self.marshaler(&host.catalog);
        let callable = CallableMarshaler::new(&objects).to_envelope(callable)?;
        let state = objects.to_envelope_opt(state)?;
        Ok((callable, state))
    }

    fn settle<R: Any>(&self, outcome: Outcome) -> Result<Option<R>, SandboxError> {
        let host = self.host();
        let objects = self.marshaler(&host.catalog);
        match outcome {
            Outcome::Returned(envelope) => Ok(objects.from_envelope_opt(&envelope)?),
            Outcome::Faulted(record) => {
                let fault = FaultEnvelope::new(&objects).reconstruct(record);
                tracing::debug!(fault = fault.type_name(), "isolated work raised");
                Err(fault.into())
            }
        }
    }

    async fn discard(&self, identity: &DomainId, context: B::Context) {
        if let Err(e) = self.backend.terminate(context).await {
            tracing::warn!(domain = %identity, error = %e, "teardown of discarded context failed");
        }
    }
}

/// Removes and tears down a domain whose execution was dropped before it
/// could dispose the domain itself.
struct DisposeOnDrop<'a, B: ContextBackend> {
    registry: &'a DomainRegistry<B>,
    handle: Option<DomainHandle<B>>,
}

impl<B: ContextBackend> DisposeOnDrop<'_, B> {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl<B: ContextBackend> Drop for DisposeOnDrop<'_, B> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        tracing::warn!(domain = %handle.identity(), "execution dropped, disposing its domain");
        if let Err(e) = self.registry.retire(&handle) {
            tracing::debug!(domain = %handle.identity(), error = %e, "domain already gone");
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = handle.teardown().await {
                        tracing::warn!(
                            domain = %handle.identity(),
                            error = %e,
                            "teardown of dropped execution failed"
                        );
                    }
                });
            }
            Err(_) => tracing::warn!(domain = %handle.identity(), "no runtime for teardown"),
        }
    }
}

/// The state must be the callable's input and the result its output.
fn check_signature<S: Any, R: Any>(signature: &Signature) -> Result<(), MarshalError> {
    if signature.input != type_name::<S>() {
        return Err(MarshalError::TypeMismatch { expected: signature.input.clone() });
    }
    if signature.output != type_name::<R>() {
        return Err(MarshalError::TypeMismatch { expected: signature.output.clone() });
    }
    Ok(())
}

fn void_result<R>() -> SandboxError {
    MarshalError::UnexpectedVoid { type_tag: type_name::<R>().to_owned() }.into()
}

/// Load `unit` into the process-wide sandbox.
///
/// # Errors
/// As [`Sandbox::load_unit`].
pub fn load_unit(unit: CodeUnit) -> Result<(), SandboxError> {
    Sandbox::global().load_unit(unit)
}

/// Create a domain in the process-wide sandbox.
///
/// # Errors
/// As [`Sandbox::create_domain`].
pub async fn create_domain(label: &str) -> Result<DomainHandle, SandboxError> {
    Sandbox::global().create_domain(label).await
}

/// Run `callable` on `state` in a fresh domain of the process-wide sandbox.
///
/// # Errors
/// As [`Sandbox::execute_in_domain`].
pub fn execute_in_domain<'a, S: Any, R: Any>(
    label: &'a str,
    callable: &Callable,
    state: &S,
) -> impl Future<Output = Result<R, SandboxError>> + Send + 'a {
    Sandbox::global().execute_in_domain(label, callable, state)
}

/// Dispose a domain of the process-wide sandbox.
///
/// # Errors
/// As [`Sandbox::dispose_domain`].
pub async fn dispose_domain(handle: &DomainHandle) -> Result<(), SandboxError> {
    Sandbox::global().dispose_domain(handle).await
}
