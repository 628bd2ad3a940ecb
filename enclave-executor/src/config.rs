//! Isolation-domain configuration.

use serde::{Deserialize, Serialize};

/// Default bound on marshaling recursion.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Configuration applied to every domain a sandbox creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DomainConfig {
    /// Deepest object graph the marshalers will walk. Cyclic graphs fail
    /// with `DepthExceeded` once they pass it.
    pub max_depth: usize,

    /// Code units that must load in a new context. Any other unit that fails
    /// to load is skipped.
    pub required_units: Vec<String>,

    /// Stack size in bytes for the context thread; platform default if unset.
    pub stack_size: Option<usize>,
}

impl DomainConfig {
    /// Create a config with sensible defaults: depth 64, no required units.
    #[must_use]
    pub fn new() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, required_units: Vec::new(), stack_size: None }
    }

    /// Set the marshaling depth limit.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Require `unit` to load in every new context.
    #[must_use]
    pub fn with_required_unit(mut self, unit: impl Into<String>) -> Self {
        self.required_units.push(unit.into());
        self
    }

    /// Set the context thread's stack size.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self::new()
    }
}
