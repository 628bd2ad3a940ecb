use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::fault::FaultRecord;
use crate::id::{DomainId, TypeTag};

/// What an isolated invocation sends back across the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The work returned; its value is enveloped.
    Returned(Envelope),
    /// The work raised or panicked; the fault is captured.
    Faulted(FaultRecord),
}

/// Record of a single invocation inside a domain.
///
/// Records are immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct InvocationRecord {
    /// Domain the invocation ran in.
    pub domain: DomainId,
    /// When the invocation entered `Executing`.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the round trip.
    pub duration: Duration,
    /// How it ended.
    pub status: InvocationStatus,
}

impl InvocationRecord {
    /// Create a new invocation record.
    #[must_use]
    pub fn new(
        domain: DomainId,
        started_at: DateTime<Utc>,
        duration: Duration,
        status: InvocationStatus,
    ) -> Self {
        Self { domain, started_at, duration, status }
    }
}

/// The end state of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum InvocationStatus {
    /// The work returned a value.
    Returned,
    /// The work raised a fault of the given type.
    Faulted {
        /// Reported type of the fault.
        type_tag: TypeTag,
    },
    /// The invocation never completed: marshaling failed or the context was lost.
    Failed {
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl InvocationStatus {
    /// Status describing `outcome`.
    #[must_use]
    pub fn of(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Returned(_) => Self::Returned,
            Outcome::Faulted(record) => Self::Faulted { type_tag: record.type_tag.clone() },
        }
    }
}
