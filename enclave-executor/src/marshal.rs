//! Object marshaling across an isolation-domain boundary.
//!
//! A value whose type is registered with a serde codec is carried whole. Any
//! other registered type implements [`Marshalable`] and is walked field by
//! field, each field becoming a nested envelope. Reconstruction looks types
//! up by tag in the catalog of the side doing the rebuilding, so a type whose
//! code unit is not loaded there cannot be rebuilt.

use std::any::{type_name, Any};
use std::collections::BTreeMap;

use enclave_core::{AnyValue, Envelope, FieldValue, MarshalError, Payload, TypeTag};

use crate::callable::{Callable, CallableMarshaler};
use crate::catalog::{Catalog, Codec};
use crate::config::DEFAULT_MAX_DEPTH;

/// A type that crosses the boundary by explicit field walking.
///
/// Fields that must not be transported are left out of `write_fields` and
/// given a default in `read_fields`.
pub trait Marshalable: Any + Send + Sized {
    /// Tag the type is registered under on every side.
    const TYPE_TAG: &'static str;

    /// Record every transportable field.
    ///
    /// # Errors
    /// Propagates the first field that cannot be represented.
    fn write_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), MarshalError>;

    /// Rebuild a value from its recorded fields.
    ///
    /// # Errors
    /// Propagates the first field that is missing or cannot be rebuilt.
    fn read_fields(fields: &FieldReader<'_>) -> Result<Self, MarshalError>;
}

/// Converts values to envelopes and back using one side's catalog.
#[derive(Clone, Copy)]
pub struct ObjectMarshaler<'c> {
    catalog: &'c Catalog,
    max_depth: usize,
}

impl<'c> ObjectMarshaler<'c> {
    /// Marshaler over `catalog` with the default depth limit.
    #[must_use]
    pub fn new(catalog: &'c Catalog) -> Self {
        Self { catalog, max_depth: DEFAULT_MAX_DEPTH }
    }

    /// Override the depth limit.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// The catalog types are resolved against.
    #[must_use]
    pub fn catalog(&self) -> &'c Catalog {
        self.catalog
    }

    /// Envelope `value`.
    ///
    /// # Errors
    /// Returns [`MarshalError::UnsupportedType`] if `T`, or any type reached
    /// through its fields, is not registered.
    pub fn to_envelope<T: Any>(&self, value: &T) -> Result<Envelope, MarshalError> {
        self.envelope_at(value, type_name::<T>(), 0)
    }

    /// Envelope an optional value; `None` becomes the void sentinel.
    ///
    /// # Errors
    /// As [`ObjectMarshaler::to_envelope`].
    pub fn to_envelope_opt<T: Any>(&self, value: Option<&T>) -> Result<Envelope, MarshalError> {
        match value {
            Some(value) => self.to_envelope(value),
            None => Ok(self.void_of::<T>()),
        }
    }

    /// Envelope a type-erased value. `type_name` is only used in errors.
    ///
    /// # Errors
    /// As [`ObjectMarshaler::to_envelope`].
    pub fn to_envelope_dyn(
        &self,
        value: &dyn Any,
        type_name: &str,
    ) -> Result<Envelope, MarshalError> {
        self.envelope_at(value, type_name, 0)
    }

    /// The void sentinel for `T`, tagged with `T`'s registered tag when known.
    #[must_use]
    pub fn void_of<T: Any>(&self) -> Envelope {
        match self.catalog.tag_of::<T>() {
            Some(tag) => Envelope::void(tag.clone()),
            None => Envelope::void(type_name::<T>()),
        }
    }

    /// Rebuild a `T`.
    ///
    /// # Errors
    /// Returns [`MarshalError::UnexpectedVoid`] for a void envelope,
    /// [`MarshalError::TypeMismatch`] if the envelope holds another type, and
    /// any error raised while rebuilding nested fields.
    pub fn from_envelope<T: Any>(&self, envelope: &Envelope) -> Result<T, MarshalError> {
        self.from_envelope_opt(envelope)?.ok_or_else(|| MarshalError::UnexpectedVoid {
            type_tag: envelope.declared_type.as_str().to_owned(),
        })
    }

    /// Rebuild an optional `T`; the void sentinel becomes `None`.
    ///
    /// # Errors
    /// As [`ObjectMarshaler::from_envelope`], except for void envelopes.
    pub fn from_envelope_opt<T: Any>(
        &self,
        envelope: &Envelope,
    ) -> Result<Option<T>, MarshalError> {
        self.from_envelope_dyn(envelope)?.map(downcast::<T>).transpose()
    }

    /// Rebuild a type-erased value; the void sentinel becomes `None`.
    ///
    /// # Errors
    /// Returns [`MarshalError::UnsupportedType`] if the declared type is not
    /// loaded on this side.
    pub fn from_envelope_dyn(&self, envelope: &Envelope) -> Result<Option<AnyValue>, MarshalError> {
        self.value_at(envelope, 0)
    }

    pub(crate) fn envelope_at(
        &self,
        value: &dyn Any,
        type_name: &str,
        depth: usize,
    ) -> Result<Envelope, MarshalError> {
        if depth > self.max_depth {
            return Err(MarshalError::DepthExceeded { limit: self.max_depth });
        }
        let entry = self.catalog.entry_by_id(value.type_id()).ok_or_else(|| {
            MarshalError::UnsupportedType {
                type_name: type_name.to_owned(),
                reason: "not registered in this catalog".to_owned(),
            }
        })?;
        match &entry.codec {
            Codec::Direct { encode, .. } => {
                let json = encode(value).map_err(|e| retag(e, &entry.tag))?;
                Ok(Envelope::direct(entry.tag.clone(), json))
            }
            Codec::Composite { write, .. } => {
                let mut fields = FieldWriter { marshaler: self, depth, fields: BTreeMap::new() };
                write(value, &mut fields)?;
                Ok(Envelope::fields(entry.tag.clone(), fields.fields))
            }
        }
    }

    pub(crate) fn value_at(
        &self,
        envelope: &Envelope,
        depth: usize,
    ) -> Result<Option<AnyValue>, MarshalError> {
        if depth > self.max_depth {
            return Err(MarshalError::DepthExceeded { limit: self.max_depth });
        }
        let tag = &envelope.declared_type;
        match &envelope.payload {
            Payload::Void => Ok(None),
            Payload::Direct(json) => match self.codec_for(tag)? {
                Codec::Direct { decode, .. } => {
                    decode(json.clone()).map(Some).map_err(|e| retag(e, tag))
                }
                Codec::Composite { .. } => Err(MarshalError::Decode {
                    type_tag: tag.clone(),
                    reason: "field-walked type received a direct payload".to_owned(),
                }),
            },
            Payload::Fields(fields) => match self.codec_for(tag)? {
                Codec::Composite { read, .. } => {
                    let reader = FieldReader { marshaler: self, depth, type_tag: tag, fields };
                    read(&reader).map(Some)
                }
                Codec::Direct { .. } => Err(MarshalError::Decode {
                    type_tag: tag.clone(),
                    reason: "directly transportable type received a field payload".to_owned(),
                }),
            },
        }
    }

    pub(crate) fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn codec_for(&self, tag: &TypeTag) -> Result<&'c Codec, MarshalError> {
        self.catalog.entry_by_tag(tag).map(|entry| &entry.codec).ok_or_else(|| {
            MarshalError::UnsupportedType {
                type_name: tag.as_str().to_owned(),
                reason: "not loaded on this side of the boundary".to_owned(),
            }
        })
    }
}

/// Codec errors name the Rust type; callers see the registered tag.
fn retag(err: MarshalError, tag: &TypeTag) -> MarshalError {
    match err {
        MarshalError::Encode { reason, .. } => {
            MarshalError::Encode { type_tag: tag.clone(), reason }
        }
        MarshalError::Decode { reason, .. } => {
            MarshalError::Decode { type_tag: tag.clone(), reason }
        }
        other => other,
    }
}

fn downcast<T: Any>(value: AnyValue) -> Result<T, MarshalError> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| MarshalError::TypeMismatch { expected: type_name::<T>().to_owned() })
}

/// Collects the fields of a value being marshaled.
pub struct FieldWriter<'a> {
    marshaler: &'a ObjectMarshaler<'a>,
    depth: usize,
    fields: BTreeMap<String, FieldValue>,
}

impl FieldWriter<'_> {
    /// Record `value` under `name`.
    ///
    /// # Errors
    /// Propagates any failure to envelope `value`.
    pub fn value<T: Any>(&mut self, name: &str, value: &T) -> Result<(), MarshalError> {
        let envelope = self.marshaler.envelope_at(value, type_name::<T>(), self.depth + 1)?;
        self.fields.insert(name.to_owned(), FieldValue::Value(envelope));
        Ok(())
    }

    /// Record an optional value; `None` is recorded as void.
    ///
    /// # Errors
    /// Propagates any failure to envelope the value.
    pub fn optional<T: Any>(&mut self, name: &str, value: Option<&T>) -> Result<(), MarshalError> {
        match value {
            Some(value) => self.value(name, value),
            None => {
                let void = self.marshaler.void_of::<T>();
                self.fields.insert(name.to_owned(), FieldValue::Value(void));
                Ok(())
            }
        }
    }

    /// Record a callable field through the callable marshaler.
    ///
    /// # Errors
    /// Returns [`MarshalError::EmptyCallable`] for a callable with no action,
    /// or any failure to envelope a bound target.
    pub fn callable(&mut self, name: &str, callable: &Callable) -> Result<(), MarshalError> {
        let envelope =
            CallableMarshaler::new(self.marshaler).to_envelope_at(callable, self.depth + 1)?;
        self.fields.insert(name.to_owned(), FieldValue::Callable(envelope));
        Ok(())
    }
}

/// Gives access to the recorded fields of a value being rebuilt.
pub struct FieldReader<'a> {
    marshaler: &'a ObjectMarshaler<'a>,
    depth: usize,
    type_tag: &'a TypeTag,
    fields: &'a BTreeMap<String, FieldValue>,
}

impl FieldReader<'_> {
    /// Tag of the value being rebuilt.
    #[must_use]
    pub fn type_tag(&self) -> &TypeTag {
        self.type_tag
    }

    /// Rebuild the required field `name`.
    ///
    /// # Errors
    /// Returns [`MarshalError::MissingField`] if absent,
    /// [`MarshalError::UnexpectedVoid`] if void, and
    /// [`MarshalError::TypeMismatch`] if it holds another type.
    pub fn value<T: Any>(&self, name: &str) -> Result<T, MarshalError> {
        if !self.has(name) {
            return Err(self.missing(name));
        }
        self.optional(name)?.ok_or_else(|| MarshalError::UnexpectedVoid {
            type_tag: format!("{}.{name}", self.type_tag),
        })
    }

    /// Rebuild an optional field; absent or void fields become `None`.
    ///
    /// # Errors
    /// Returns [`MarshalError::TypeMismatch`] if the field holds another type.
    pub fn optional<T: Any>(&self, name: &str) -> Result<Option<T>, MarshalError> {
        match self.fields.get(name) {
            None => Ok(None),
            Some(FieldValue::Value(envelope)) => self
                .marshaler
                .value_at(envelope, self.depth + 1)?
                .map(downcast::<T>)
                .transpose(),
            Some(FieldValue::Callable(_)) => {
                Err(MarshalError::TypeMismatch { expected: type_name::<T>().to_owned() })
            }
        }
    }

    /// Rebuild the callable field `name`.
    ///
    /// # Errors
    /// Returns [`MarshalError::MissingField`] if absent and any failure to
    /// rebind the callable.
    pub fn callable(&self, name: &str) -> Result<Callable, MarshalError> {
        match self.fields.get(name) {
            Some(FieldValue::Callable(envelope)) => {
                CallableMarshaler::new(self.marshaler).from_envelope_at(envelope, self.depth + 1)
            }
            Some(FieldValue::Value(_)) => {
                Err(MarshalError::TypeMismatch { expected: type_name::<Callable>().to_owned() })
            }
            None => Err(self.missing(name)),
        }
    }

    /// Whether the field was recorded.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    fn missing(&self, name: &str) -> MarshalError {
        MarshalError::MissingField { type_tag: self.type_tag.clone(), field: name.to_owned() }
    }
}
