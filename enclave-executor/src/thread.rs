//! Thread-per-domain backend.
//!
//! Each context owns a dedicated OS thread and a catalog populated on that
//! thread. Requests reach it over an unbounded channel and answers come
//! back on a oneshot, so an invocation suspends the calling task until the
//! context has finished with it.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use enclave_core::{CallableEnvelope, DomainId, Envelope, MarshalError, Outcome};
use tokio::sync::{mpsc, oneshot};

use crate::backend::{ContextBackend, Spawned};
use crate::catalog::CodeUnit;
use crate::config::DomainConfig;
use crate::context::{execute, populate, Population};
use crate::error::SandboxError;
use crate::fault::FaultEnvelope;
use crate::marshal::ObjectMarshaler;

/// Runs every domain's context on its own OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadBackend;

impl ThreadBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// A live context thread.
#[derive(Debug)]
pub struct ThreadContext {
    identity: DomainId,
    requests: mpsc::UnboundedSender<Request>,
    thread: JoinHandle<()>,
}

impl ThreadContext {
    /// Name of the OS thread hosting the context.
    #[must_use]
    pub fn thread_name(&self) -> Option<&str> {
        self.thread.thread().name()
    }
}

#[derive(Debug)]
struct Request {
    callable: CallableEnvelope,
    state: Envelope,
    reply: oneshot::Sender<Result<Outcome, MarshalError>>,
}

#[async_trait]
impl ContextBackend for ThreadBackend {
    type Context = ThreadContext;

    async fn spawn(
        &self,
        identity: &DomainId,
        units: &[CodeUnit],
        config: &DomainConfig,
    ) -> Result<Spawned<ThreadContext>, SandboxError> {
        let (requests, inbox) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let units = units.to_vec();
        let max_depth = config.max_depth;

        let mut builder = thread::Builder::new().name(format!("enclave-{identity}"));
        if let Some(bytes) = config.stack_size {
            builder = builder.stack_size(bytes);
        }
        let thread = builder
            .spawn(move || context_main(&units, max_depth, ready_tx, inbox))
            .map_err(|e| SandboxError::SpawnFailed(format!("start context thread: {e}")))?;

        let population: Population = ready_rx.await.map_err(|_| {
            SandboxError::SpawnFailed(format!("context of {identity} exited before becoming ready"))
        })?;

        tracing::info!(
            domain = %identity,
            loaded = population.loaded.len(),
            skipped = population.skipped.len(),
            "context ready"
        );

        Ok(Spawned::new(ThreadContext { identity: identity.clone(), requests, thread }, population))
    }

    async fn invoke(
        &self,
        context: &ThreadContext,
        callable: CallableEnvelope,
        state: Envelope,
    ) -> Result<Outcome, SandboxError> {
        let (reply, answer) = oneshot::channel();
        context
            .requests
            .send(Request { callable, state, reply })
            .map_err(|_| SandboxError::ContextLost(context.identity.clone()))?;
        let outcome =
            answer.await.map_err(|_| SandboxError::ContextLost(context.identity.clone()))?;
        Ok(outcome?)
    }

    async fn terminate(&self, context: ThreadContext) -> Result<(), SandboxError> {
        let ThreadContext { identity, requests, thread } = context;
        // Closing the channel ends the context loop.
        drop(requests);
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        match joined {
            Ok(Ok(())) => {
                tracing::debug!(domain = %identity, "context thread joined");
                Ok(())
            }
            Ok(Err(_)) | Err(_) => Err(SandboxError::ContextLost(identity)),
        }
    }
}

fn context_main(
    units: &[CodeUnit],
    max_depth: usize,
    ready: oneshot::Sender<Population>,
    mut inbox: mpsc::UnboundedReceiver<Request>,
) {
    let (catalog, population) = populate(units);
    if ready.send(population).is_err() {
        return;
    }
    let objects = ObjectMarshaler::new(&catalog).with_max_depth(max_depth);

    while let Some(request) = inbox.blocking_recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            execute(&objects, &request.callable, &request.state)
        }))
        .unwrap_or_else(|payload| {
            Ok(Outcome::Faulted(FaultEnvelope::new(&objects).capture_panic(payload.as_ref())))
        });
        if request.reply.send(outcome).is_err() {
            tracing::debug!("caller stopped waiting for an outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use enclave_core::Payload;

    use super::*;
    use crate::callable::{Callable, CallableMarshaler};
    use crate::catalog::Catalog;

    fn envelope_of(callable: &Callable) -> CallableEnvelope {
        let catalog = Catalog::new();
        let objects = ObjectMarshaler::new(&catalog);
        CallableMarshaler::new(&objects).to_envelope(callable).expect("marshal callable")
    }

    #[tokio::test]
    async fn context_runs_on_named_thread() {
        let backend = ThreadBackend::new();
        let identity = DomainId::generate("named").expect("valid label");
        let spawned = backend.spawn(&identity, &[], &DomainConfig::new()).await.expect("spawn");
        let name = spawned.context.thread_name().map(str::to_owned);
        assert_eq!(name, Some(format!("enclave-{identity}")));

        let where_am_i =
            Callable::new(|(): ()| thread::current().name().map(str::to_owned).unwrap_or_default());
        let outcome = backend
            .invoke(
                &spawned.context,
                envelope_of(&where_am_i),
                Envelope::direct("unit", serde_json::Value::Null),
            )
            .await
            .expect("invoke");
        match outcome {
            Outcome::Returned(envelope) => {
                let expected = serde_json::json!(format!("enclave-{identity}"));
                assert_eq!(envelope.payload, Payload::Direct(expected));
            }
            Outcome::Faulted(record) => panic!("unexpected fault: {}", record.message),
        }
        backend.terminate(spawned.context).await.expect("terminate");
    }

    #[tokio::test]
    async fn marshal_failure_inside_context_is_reported() {
        let backend = ThreadBackend::new();
        let identity = DomainId::generate("strict").expect("valid label");
        let spawned = backend.spawn(&identity, &[], &DomainConfig::new()).await.expect("spawn");
        let state = Envelope::direct("not-loaded", serde_json::json!(1));
        let identity_fn = envelope_of(&Callable::new(|n: i64| n));
        let result = backend.invoke(&spawned.context, identity_fn, state).await;
        assert!(result.as_ref().is_err_and(SandboxError::is_unsupported_type), "got {result:?}");
        backend.terminate(spawned.context).await.expect("terminate");
    }

    #[tokio::test]
    async fn dead_context_reports_context_lost() {
        let backend = ThreadBackend::new();
        let identity = DomainId::generate("dead").expect("valid label");
        let (requests, inbox) = mpsc::unbounded_channel::<Request>();
        drop(inbox);
        let context = ThreadContext { identity, requests, thread: thread::spawn(|| {}) };
        let state = Envelope::direct("i64", serde_json::json!(1));
        let result = backend.invoke(&context, envelope_of(&Callable::new(|n: i64| n)), state).await;
        assert!(matches!(result, Err(SandboxError::ContextLost(_))), "got {result:?}");
        backend.terminate(context).await.expect("joining a finished thread succeeds");
    }
}
