//! Units of work and their boundary representation.
//!
//! A [`Callable`] is one of three things:
//!
//! - a closure, which crosses whole because its captures are `Send`. The
//!   captures are shared with the caller, not copied.
//! - a closure over explicit state ([`Callable::capture`]), which crosses as
//!   the closure plus a snapshot of the state.
//! - a registered method bound to a target value, which crosses as the
//!   method's identifier plus a snapshot of the target.
//!
//! Snapshots are taken when the callable is marshaled; later changes to the
//! original state or target are not seen on the other side.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use enclave_core::{
    unpack, AnyValue, BoxError, CallableEnvelope, DirectFn, InvokeError, MarshalError, MethodFn,
    MethodId, Raised, Signature,
};

use crate::catalog::MethodEntry;
use crate::marshal::ObjectMarshaler;

/// A unit of work that can be run inside an isolation domain.
pub struct Callable {
    kind: Kind,
}

enum Kind {
    Empty,
    Direct {
        signature: Signature,
        call: DirectFn,
    },
    Bound {
        method: MethodId,
        signature: Signature,
        target: AnyValue,
        target_name: &'static str,
        call: MethodFn,
    },
    Captured {
        signature: Signature,
        state: AnyValue,
        state_name: &'static str,
        call: MethodFn,
    },
}

impl Callable {
    /// Wrap an infallible closure.
    ///
    /// Whatever the closure captures is shared with the domain that runs it.
    /// Use [`Callable::capture`] for state that must be copied at the
    /// boundary.
    pub fn new<S, R, F>(work: F) -> Self
    where
        S: Any,
        R: Any + Send,
        F: Fn(S) -> R + Send + Sync + 'static,
    {
        let call: DirectFn = Arc::new(move |arg: Option<AnyValue>| {
            let arg = unpack::<S>(arg)?;
            Ok(Box::new(work(arg)) as AnyValue)
        });
        Self { kind: Kind::Direct { signature: Signature::of::<S, R>(), call } }
    }

    /// Wrap a closure that may raise an error.
    ///
    /// The error is captured inside the domain and rebuilt on the caller
    /// side as an [`IsolatedFault`](enclave_core::IsolatedFault).
    pub fn try_new<S, R, E, F>(work: F) -> Self
    where
        S: Any,
        R: Any + Send,
        E: Into<BoxError> + 'static,
        F: Fn(S) -> Result<R, E> + Send + Sync + 'static,
    {
        let call: DirectFn = Arc::new(move |arg: Option<AnyValue>| {
            let arg = unpack::<S>(arg)?;
            work(arg)
                .map(|value| Box::new(value) as AnyValue)
                .map_err(|err| InvokeError::Raised(Raised::new(err)))
        });
        Self { kind: Kind::Direct { signature: Signature::of::<S, R>(), call } }
    }

    /// Wrap a closure whose state may be absent.
    pub fn optional<S, R, E, F>(work: F) -> Self
    where
        S: Any,
        R: Any + Send,
        E: Into<BoxError> + 'static,
        F: Fn(Option<S>) -> Result<R, E> + Send + Sync + 'static,
    {
        let call: DirectFn = Arc::new(move |arg: Option<AnyValue>| {
            let arg = arg
                .map(|value| {
                    value.downcast::<S>().map(|boxed| *boxed).map_err(|_| {
                        MarshalError::TypeMismatch { expected: type_name::<S>().to_owned() }
                    })
                })
                .transpose()?;
            work(arg)
                .map(|value| Box::new(value) as AnyValue)
                .map_err(|err| InvokeError::Raised(Raised::new(err)))
        });
        Self { kind: Kind::Direct { signature: Signature::of::<S, R>(), call } }
    }

    /// Wrap a closure over `state`. The state is marshaled with the callable,
    /// so the domain works on a snapshot taken at marshal time. `T` must be
    /// registered on both sides.
    pub fn capture<T, S, R, F>(state: T, work: F) -> Self
    where
        T: Any + Send,
        S: Any,
        R: Any + Send,
        F: Fn(&T, S) -> R + Send + Sync + 'static,
    {
        Self::try_capture(state, move |state: &T, arg: S| Ok::<_, BoxError>(work(state, arg)))
    }

    /// [`Callable::capture`] for a closure that may raise an error.
    pub fn try_capture<T, S, R, E, F>(state: T, work: F) -> Self
    where
        T: Any + Send,
        S: Any,
        R: Any + Send,
        E: Into<BoxError> + 'static,
        F: Fn(&T, S) -> Result<R, E> + Send + Sync + 'static,
    {
        let call: MethodFn = Arc::new(move |state: &mut (dyn Any + Send), arg: Option<AnyValue>| {
            let state = state
                .downcast_ref::<T>()
                .ok_or_else(|| {
                    MarshalError::TypeMismatch { expected: type_name::<T>().to_owned() }
                })?;
            let arg = unpack::<S>(arg)?;
            work(state, arg)
                .map(|value| Box::new(value) as AnyValue)
                .map_err(|err| InvokeError::Raised(Raised::new(err)))
        });
        Self {
            kind: Kind::Captured {
                signature: Signature::of::<S, R>(),
                state: Box::new(state),
                state_name: type_name::<T>(),
                call,
            },
        }
    }

    /// A callable with no action. It cannot be marshaled or invoked.
    #[must_use]
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    pub(crate) fn bound(method: MethodId, entry: &MethodEntry, target: AnyValue) -> Self {
        Self {
            kind: Kind::Bound {
                method,
                signature: entry.signature.clone(),
                target,
                target_name: entry.target_name,
                call: Arc::clone(&entry.call),
            },
        }
    }

    /// Whether there is no action to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    /// Whether this is a method bound to a target.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        matches!(self.kind, Kind::Bound { .. })
    }

    /// Shape of the callable, if it has one.
    #[must_use]
    pub fn signature(&self) -> Option<&Signature> {
        match &self.kind {
            Kind::Empty => None,
            Kind::Direct { signature, .. }
            | Kind::Bound { signature, .. }
            | Kind::Captured { signature, .. } => Some(signature),
        }
    }

    /// Identifier of the bound method.
    #[must_use]
    pub fn method(&self) -> Option<&MethodId> {
        match &self.kind {
            Kind::Bound { method, .. } => Some(method),
            Kind::Empty | Kind::Direct { .. } | Kind::Captured { .. } => None,
        }
    }

    /// The bound target or captured state, if it is a `T`.
    #[must_use]
    pub fn target<T: Any>(&self) -> Option<&T> {
        match &self.kind {
            Kind::Bound { target, .. } | Kind::Captured { state: target, .. } => {
                target.downcast_ref::<T>()
            }
            Kind::Empty | Kind::Direct { .. } => None,
        }
    }

    /// Mutable access to the bound target or captured state, if it is a `T`.
    pub fn target_mut<T: Any>(&mut self) -> Option<&mut T> {
        match &mut self.kind {
            Kind::Bound { target, .. } | Kind::Captured { state: target, .. } => {
                target.downcast_mut::<T>()
            }
            Kind::Empty | Kind::Direct { .. } => None,
        }
    }

    /// Run the callable on a type-erased argument.
    ///
    /// # Errors
    /// Returns [`InvokeError::Marshal`] if the callable is empty or the
    /// argument has the wrong type, and [`InvokeError::Raised`] if the work
    /// raised an error.
    pub fn invoke(&mut self, arg: Option<AnyValue>) -> Result<AnyValue, InvokeError> {
        match &mut self.kind {
            Kind::Empty => Err(MarshalError::EmptyCallable.into()),
            Kind::Direct { call, .. } => call(arg),
            Kind::Bound { target, call, .. } | Kind::Captured { state: target, call, .. } => {
                call(&mut **target, arg)
            }
        }
    }

    /// Run the callable in place on a typed argument.
    ///
    /// # Errors
    /// As [`Callable::invoke`], plus [`MarshalError::TypeMismatch`] if the
    /// result is not an `R`.
    pub fn call<S: Any + Send, R: Any>(&mut self, arg: S) -> Result<R, InvokeError> {
        let value = self.invoke(Some(Box::new(arg)))?;
        Ok(unpack::<R>(Some(value))?)
    }
}

impl Default for Callable {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => f.write_str("Callable::Empty"),
            Kind::Direct { signature, .. } => f
                .debug_struct("Callable::Direct")
                .field("signature", signature)
                .finish_non_exhaustive(),
            Kind::Bound { method, signature, target_name, .. } => f
                .debug_struct("Callable::Bound")
                .field("method", method)
                .field("signature", signature)
                .field("target", target_name)
                .finish_non_exhaustive(),
            Kind::Captured { signature, state_name, .. } => f
                .debug_struct("Callable::Captured")
                .field("signature", signature)
                .field("state", state_name)
                .finish_non_exhaustive(),
        }
    }
}

/// Converts callables to [`CallableEnvelope`]s and back.
pub struct CallableMarshaler<'m> {
    objects: &'m ObjectMarshaler<'m>,
}

impl<'m> CallableMarshaler<'m> {
    /// Marshaler that envelopes bound targets with `objects`.
    #[must_use]
    pub fn new(objects: &'m ObjectMarshaler<'m>) -> Self {
        Self { objects }
    }

    /// Envelope `callable`.
    ///
    /// A closure is carried whole. A bound method is carried as its
    /// identifier and signature plus an envelope of the target taken now,
    /// and a closure over explicit state as the closure plus an envelope of
    /// the state.
    ///
    /// # Errors
    /// Returns [`MarshalError::EmptyCallable`] for an empty callable and any
    /// error raised while enveloping the target.
    pub fn to_envelope(&self, callable: &Callable) -> Result<CallableEnvelope, MarshalError> {
        self.to_envelope_at(callable, 0)
    }

    /// Rebuild a callable on this side.
    ///
    /// # Errors
    /// Returns [`MarshalError::UnknownMethod`] if the method is not loaded
    /// here, [`MarshalError::SignatureMismatch`] if it is loaded with another
    /// shape, and any error raised while rebuilding the target.
    pub fn from_envelope(&self, envelope: &CallableEnvelope) -> Result<Callable, MarshalError> {
        self.from_envelope_at(envelope, 0)
    }

    pub(crate) fn to_envelope_at(
        &self,
        callable: &Callable,
        depth: usize,
    ) -> Result<CallableEnvelope, MarshalError> {
        match &callable.kind {
            Kind::Empty => Err(MarshalError::EmptyCallable),
            Kind::Direct { signature, call } => Ok(CallableEnvelope::Direct {
                signature: signature.clone(),
                delegate: Arc::clone(call),
            }),
            Kind::Bound { method, signature, target, target_name, .. } => {
                let target = self.objects.envelope_at(&**target, target_name, depth + 1)?;
                Ok(CallableEnvelope::BoundMethod {
                    signature: signature.clone(),
                    method: method.clone(),
                    target: Box::new(target),
                })
            }
            Kind::Captured { signature, state, state_name, call } => {
                let state = self.objects.envelope_at(&**state, state_name, depth + 1)?;
                Ok(CallableEnvelope::Captured {
                    signature: signature.clone(),
                    delegate: Arc::clone(call),
                    state_name: *state_name,
                    state: Box::new(state),
                })
            }
        }
    }

    pub(crate) fn from_envelope_at(
        &self,
        envelope: &CallableEnvelope,
        depth: usize,
    ) -> Result<Callable, MarshalError> {
        match envelope {
            CallableEnvelope::Direct { signature, delegate } => Ok(Callable {
                kind: Kind::Direct { signature: signature.clone(), call: Arc::clone(delegate) },
            }),
            CallableEnvelope::BoundMethod { signature, method, target } => {
                let entry = self
                    .objects
                    .catalog()
                    .method(method)
                    .ok_or_else(|| MarshalError::UnknownMethod { method: method.clone() })?;
                if &entry.signature != signature {
                    return Err(MarshalError::SignatureMismatch {
                        method: method.clone(),
                        expected: signature.clone(),
                        found: entry.signature.clone(),
                    });
                }
                let target = self.objects.value_at(target, depth + 1)?.ok_or_else(|| {
                    let type_tag = target.declared_type.as_str().to_owned();
                    MarshalError::UnexpectedVoid { type_tag }
                })?;
                if (*target).type_id() != entry.target {
                    let expected = entry.target_name.to_owned();
                    return Err(MarshalError::TypeMismatch { expected });
                }
                Ok(Callable::bound(method.clone(), entry, target))
            }
            CallableEnvelope::Captured { signature, delegate, state_name, state } => {
                let state = self.objects.value_at(state, depth + 1)?.ok_or_else(|| {
                    let type_tag = state.declared_type.as_str().to_owned();
                    MarshalError::UnexpectedVoid { type_tag }
                })?;
                Ok(Callable {
                    kind: Kind::Captured {
                        signature: signature.clone(),
                        state,
                        state_name: *state_name,
                        call: Arc::clone(delegate),
                    },
                })
            }
        }
    }
}
