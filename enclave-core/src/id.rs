use std::any::type_name;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Process-unique identity of an isolation domain.
///
/// Format: `<label>_<suffix>` where the suffix is 12 random hex digits.
/// Assigned once at creation and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DomainId(String);

impl DomainId {
    /// Generates a fresh identity for `label`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidLabel`] if `label` is empty, whitespace-only
    /// or contains control characters.
    pub fn generate(label: &str) -> Result<Self, CoreError> {
        if label.trim().is_empty() || label.chars().any(char::is_control) {
            return Err(CoreError::InvalidLabel { label: label.to_owned() });
        }
        let suffix = Uuid::new_v4().as_u128() & 0xffff_ffff_ffff;
        Ok(Self(format!("{label}_{suffix:012x}")))
    }

    /// Returns the full identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the human label the identity was generated from.
    #[must_use]
    pub fn label(&self) -> &str {
        self.0.rsplit_once('_').map_or(self.0.as_str(), |(label, _)| label)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable name under which a type is registered on both sides of a boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(String);

impl TypeTag {
    /// Creates a `TypeTag` from any string-like value.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Returns the tag text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TypeTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable reference to a registered method, e.g. `"greeter.greet"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(String);

impl MethodId {
    /// Creates a `MethodId` from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MethodId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for MethodId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Shape of a callable: the Rust types it accepts and returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Fully-qualified input type name.
    pub input: String,
    /// Fully-qualified output type name.
    pub output: String,
}

impl Signature {
    /// Signature of a callable taking `S` and returning `R`.
    #[must_use]
    pub fn of<S: ?Sized, R: ?Sized>() -> Self {
        Self { input: type_name::<S>().to_owned(), output: type_name::<R>().to_owned() }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn({}) -> {}", self.input, self.output)
    }
}
