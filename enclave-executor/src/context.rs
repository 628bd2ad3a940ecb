//! What runs on the far side of the boundary: populating a fresh catalog
//! and executing one invocation against it.

use std::panic::{self, AssertUnwindSafe};

use enclave_core::{CallableEnvelope, Envelope, InvokeError, MarshalError, Outcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::callable::CallableMarshaler;
use crate::catalog::{Catalog, CodeUnit};
use crate::fault::{panic_message, FaultEnvelope};
use crate::marshal::ObjectMarshaler;

/// A code unit that did not load into a new context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedUnit {
    /// Name of the unit.
    pub unit: String,
    /// Why it did not load.
    pub reason: String,
}

/// Which code units made it into a context's catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Population {
    /// Units loaded, in load order.
    pub loaded: Vec<String>,
    /// Units skipped, in load order.
    pub skipped: Vec<SkippedUnit>,
}

impl Population {
    /// Why `unit` was skipped, if it was.
    #[must_use]
    pub fn skip_reason(&self, unit: &str) -> Option<&str> {
        self.skipped.iter().find(|s| s.unit == unit).map(|s| s.reason.as_str())
    }
}

/// Replay `units` into a fresh catalog.
///
/// Each unit is staged on a copy of the catalog so a unit that fails or
/// panics halfway leaves no partial registrations behind.
pub(crate) fn populate(units: &[CodeUnit]) -> (Catalog, Population) {
    let mut catalog = Catalog::new();
    let mut population = Population::default();
    for unit in units {
        let mut staged = catalog.clone();
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| unit.load_into(&mut staged))) {
            Ok(Ok(())) => {
                catalog = staged;
                population.loaded.push(unit.name().to_owned());
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("loader panicked: {}", panic_message(payload.as_ref())),
        };
        debug!(unit = unit.name(), %reason, "code unit skipped");
        population.skipped.push(SkippedUnit { unit: unit.name().to_owned(), reason });
    }
    (catalog, population)
}

/// Rebuild `callable` and `state` against `objects`, run the work, and
/// envelope what it produced.
///
/// A returned error or a panic becomes [`Outcome::Faulted`]. Marshaling
/// failures on either leg are returned as errors.
pub(crate) fn execute(
    objects: &ObjectMarshaler<'_>,
    callable: &CallableEnvelope,
    state: &Envelope,
) -> Result<Outcome, MarshalError> {
    let mut work = CallableMarshaler::new(objects).from_envelope(callable)?;
    let arg = objects.from_envelope_dyn(state)?;
    let faults = FaultEnvelope::new(objects);

    match panic::catch_unwind(AssertUnwindSafe(|| work.invoke(arg))) {
        Ok(Ok(value)) => {
            let envelope = objects.to_envelope_dyn(&*value, &callable.signature().output)?;
            Ok(Outcome::Returned(envelope))
        }
        Ok(Err(InvokeError::Raised(raised))) => Ok(Outcome::Faulted(faults.capture(&raised))),
        Ok(Err(InvokeError::Marshal(e))) => Err(e),
        Err(payload) => {
            warn!(panic = %panic_message(payload.as_ref()), "isolated work panicked");
            Ok(Outcome::Faulted(faults.capture_panic(payload.as_ref())))
        }
    }
}

#[cfg(test)]
mod tests {
    use enclave_core::{DivideByZero, Payload};

    use super::*;
    use crate::callable::Callable;
    use crate::error::CatalogError;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Token(u64);

    fn run(
        catalog: &Catalog,
        callable: &Callable,
        state: &Envelope,
    ) -> Result<Outcome, MarshalError> {
        let objects = ObjectMarshaler::new(catalog);
        let envelope = CallableMarshaler::new(&objects).to_envelope(callable)?;
        execute(&objects, &envelope, state)
    }

    #[test]
    fn populate_loads_and_skips_in_order() {
        let units = vec![
            CodeUnit::new("tokens", |c: &mut Catalog| c.register_direct::<Token>("token")),
            CodeUnit::new("host-only", |_: &mut Catalog| {
                Err(CatalogError::Unavailable { reason: "needs the host".to_owned() })
            }),
            CodeUnit::new("broken", |_: &mut Catalog| -> Result<(), CatalogError> {
                panic!("bad loader")
            }),
        ];
        let (catalog, population) = populate(&units);
        assert!(catalog.contains::<Token>());
        assert_eq!(population.loaded, ["tokens"]);
        assert_eq!(population.skipped.len(), 2);
        assert!(population.skip_reason("host-only").is_some_and(|r| r.contains("needs the host")));
        assert!(population.skip_reason("broken").is_some_and(|r| r.contains("bad loader")));
    }

    #[test]
    fn failed_unit_leaves_no_partial_registrations() {
        let units = vec![CodeUnit::new("half", |c: &mut Catalog| {
            c.register_direct::<Token>("token")?;
            Err(CatalogError::Unavailable { reason: "stopped halfway".to_owned() })
        })];
        let (catalog, population) = populate(&units);
        assert!(!catalog.contains::<Token>(), "staged registrations must be discarded");
        assert!(population.loaded.is_empty());
    }

    #[test]
    fn returned_value_is_enveloped() {
        let catalog = Catalog::new();
        let inc = Callable::new(|n: i64| n + 1);
        let outcome = run(&catalog, &inc, &Envelope::direct("i64", serde_json::json!(41)));
        match outcome {
            Ok(Outcome::Returned(envelope)) => {
                assert_eq!(envelope.payload, Payload::Direct(serde_json::json!(42)));
            }
            other => panic!("expected a returned value, got {other:?}"),
        }
    }

    #[test]
    fn raised_error_becomes_fault() {
        let catalog = Catalog::new();
        let div = Callable::try_new(|n: i64| if n == 0 { Err(DivideByZero) } else { Ok(1 / n) });
        match run(&catalog, &div, &Envelope::direct("i64", serde_json::json!(0))) {
            Ok(Outcome::Faulted(record)) => assert_eq!(record.type_tag.as_str(), "DivideByZero"),
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[test]
    fn panic_is_contained() {
        let catalog = Catalog::new();
        let boom = Callable::new(|n: i64| -> i64 { panic!("boom at {n}") });
        match run(&catalog, &boom, &Envelope::direct("i64", serde_json::json!(3))) {
            Ok(Outcome::Faulted(record)) => {
                assert_eq!(record.type_tag.as_str(), "Panicked");
                assert!(record.message.contains("boom at 3"));
            }
            other => panic!("expected a contained panic, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_result_type_fails_marshaling() {
        let catalog = Catalog::new();
        let mint = Callable::new(|n: u64| Token(n));
        assert!(matches!(
            run(&catalog, &mint, &Envelope::direct("u64", serde_json::json!(1))),
            Err(MarshalError::UnsupportedType { .. })
        ));
    }
}
