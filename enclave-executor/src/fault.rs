//! Capture of errors raised inside a domain and their rebuilding outside it.

use std::any::{type_name, Any};
use std::backtrace::Backtrace;
use std::error::Error;

use enclave_core::{BoxError, FaultRecord, IsolatedFault, Panicked, Raised, RemoteFault, TypeTag};
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::marshal::ObjectMarshaler;

/// Converts raised errors to [`FaultRecord`]s and records back to errors.
///
/// A registered fault type is rebuilt as itself when its detail survives
/// marshaling on the receiving side. Anything else is rebuilt as a
/// [`RemoteFault`] that reports the captured type, message and stack trace.
pub struct FaultEnvelope<'m> {
    objects: &'m ObjectMarshaler<'m>,
}

impl<'m> FaultEnvelope<'m> {
    #[must_use]
    pub fn new(objects: &'m ObjectMarshaler<'m>) -> Self {
        Self { objects }
    }

    /// Capture an error returned by a unit of work.
    #[must_use]
    pub fn capture(&self, raised: &Raised) -> FaultRecord {
        self.capture_error(raised.error.as_ref(), Some(raised.raised_as))
    }

    /// Capture `err`. `raised_as` is its static type name when known.
    #[must_use]
    pub fn capture_error(
        &self,
        err: &(dyn Error + 'static),
        raised_as: Option<&str>,
    ) -> FaultRecord {
        let stack_trace = Backtrace::force_capture().to_string();
        self.record(err, raised_as, stack_trace, 0)
    }

    /// Capture a panic payload as a [`Panicked`] fault.
    #[must_use]
    pub fn capture_panic(&self, payload: &(dyn Any + Send)) -> FaultRecord {
        let message = panic_message(payload);
        self.capture_error(&Panicked { message }, Some(type_name::<Panicked>()))
    }

    /// Rebuild the error `record` describes, on this side.
    #[must_use]
    pub fn reconstruct(&self, record: FaultRecord) -> IsolatedFault {
        let error = self.rebuild(&record);
        IsolatedFault::new(record, error)
    }

    fn record(
        &self,
        err: &(dyn Error + 'static),
        raised_as: Option<&str>,
        stack_trace: String,
        depth: usize,
    ) -> FaultRecord {
        if let Some(nested) = as_isolated(err) {
            return nested.record().clone();
        }
        let cause = if depth < self.objects.max_depth() {
            err.source().map(|source| Box::new(self.record(source, None, String::new(), depth + 1)))
        } else {
            None
        };
        let message = err.to_string();

        if let Some(remote) = err.downcast_ref::<RemoteFault>() {
            return FaultRecord {
                type_tag: remote.type_tag().clone(),
                qualified_name: remote.qualified_name().to_owned(),
                message,
                stack_trace: remote.stack_trace().to_owned(),
                detail: remote.fields().cloned(),
                cause,
            };
        }

        if let Some((entry, value)) = self.objects.catalog().fault_for(err) {
            let detail = match self.objects.to_envelope_dyn(value, entry.qualified_name) {
                Ok(detail) => Some(detail),
                Err(e) => {
                    warn!(fault = %entry.tag, error = %e, "fault detail could not be marshaled");
                    None
                }
            };
            return FaultRecord {
                type_tag: entry.tag.clone(),
                qualified_name: entry.qualified_name.to_owned(),
                message,
                stack_trace,
                detail,
                cause,
            };
        }

        let qualified_name = match (std_error_name(err), raised_as) {
            (Some(name), _) => name.to_owned(),
            (None, Some(name)) if !name.starts_with("alloc::boxed::Box<dyn ") => name.to_owned(),
            (None, _) => debug_name(err),
        };
        FaultRecord {
            type_tag: TypeTag::new(short_name(&qualified_name)),
            qualified_name,
            message,
            stack_trace,
            detail: None,
            cause,
        }
    }

    fn rebuild(&self, record: &FaultRecord) -> BoxError {
        let Some(entry) = self.objects.catalog().fault_by_tag(&record.type_tag) else {
            debug!(fault = %record.type_tag, "fault type not registered here, rebuilt as remote");
            return Box::new(RemoteFault::from_record(record));
        };
        let value = record.detail.as_ref().map(|detail| self.objects.from_envelope_dyn(detail));
        match value {
            Some(Ok(Some(value))) => match (entry.into_error)(value) {
                Some(error) => error,
                None => Box::new(RemoteFault::from_record(record)),
            },
            Some(Err(e)) => {
                warn!(fault = %record.type_tag, error = %e, "fault detail could not be rebuilt");
                Box::new(RemoteFault::from_record(record))
            }
            Some(Ok(None)) | None => Box::new(RemoteFault::from_record(record)),
        }
    }
}

/// Text of a panic payload, when it is a string.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// The fault a nested domain already captured, when `err` carries one.
fn as_isolated<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a IsolatedFault> {
    err.downcast_ref::<IsolatedFault>()
        .or_else(|| err.downcast_ref::<SandboxError>().and_then(SandboxError::as_isolated))
}

/// Name of a standard library error, whose `Debug` form names a variant or
/// an internal representation rather than the type.
fn std_error_name(err: &(dyn Error + 'static)) -> Option<&'static str> {
    macro_rules! first_match {
        ($($ty:ty => $name:literal),+ $(,)?) => {
            $( if err.is::<$ty>() { return Some($name); } )+
        };
    }
    first_match!(
        std::io::Error => "std::io::Error",
        std::fmt::Error => "std::fmt::Error",
        std::num::ParseIntError => "std::num::ParseIntError",
        std::num::ParseFloatError => "std::num::ParseFloatError",
        std::num::TryFromIntError => "std::num::TryFromIntError",
        std::str::ParseBoolError => "std::str::ParseBoolError",
        std::str::Utf8Error => "std::str::Utf8Error",
        std::string::FromUtf8Error => "std::string::FromUtf8Error",
        std::char::ParseCharError => "std::char::ParseCharError",
        std::array::TryFromSliceError => "std::array::TryFromSliceError",
        serde_json::Error => "serde_json::Error",
    );
    None
}

/// Leading identifier of the error's `Debug` form, which is the type name for
/// derived impls.
fn debug_name(err: &dyn Error) -> String {
    let debug = format!("{err:?}");
    let name: String = debug.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    if name.is_empty() {
        "Error".to_owned()
    } else {
        name
    }
}

/// `a::b::Type<c::D>` to `Type`.
fn short_name(qualified: &str) -> &str {
    let base = qualified.split('<').next().unwrap_or(qualified);
    base.rsplit("::").next().unwrap_or(base)
}
