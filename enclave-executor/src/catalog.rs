//! Registry of the types, methods and faults one side of a boundary knows.
//!
//! Every isolation domain gets its own [`Catalog`], populated by replaying
//! the host's [`CodeUnit`]s. A type is only rebuildable on a side whose
//! catalog has it, which is how "the type's defining unit is not loaded in
//! the target" surfaces.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use enclave_core::{
    unpack, AnyValue, ArgumentError, BoxError, DivideByZero, InvalidOperation, InvokeError,
    MarshalError, MethodFn, MethodId, Panicked, Raised, Signature, TypeTag,
};

use crate::callable::Callable;
use crate::error::CatalogError;
use crate::marshal::{FieldReader, FieldWriter, Marshalable};

type EncodeFn = fn(&dyn Any) -> Result<serde_json::Value, MarshalError>;
type DecodeFn = fn(serde_json::Value) -> Result<AnyValue, MarshalError>;
type WriteFn = fn(&dyn Any, &mut FieldWriter<'_>) -> Result<(), MarshalError>;
type ReadFn = fn(&FieldReader<'_>) -> Result<AnyValue, MarshalError>;
type ViewFn = for<'a> fn(&'a (dyn Error + 'static)) -> Option<&'a dyn Any>;
type IntoErrorFn = fn(AnyValue) -> Option<BoxError>;

/// How values of a registered type cross the boundary.
#[derive(Clone, Copy)]
pub(crate) enum Codec {
    /// Carried whole as the value's serde form.
    Direct { encode: EncodeFn, decode: DecodeFn },
    /// Walked field by field through [`Marshalable`].
    Composite { write: WriteFn, read: ReadFn },
}

#[derive(Clone)]
pub(crate) struct TypeEntry {
    pub(crate) tag: TypeTag,
    pub(crate) codec: Codec,
}

#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub(crate) target: TypeId,
    pub(crate) target_name: &'static str,
    pub(crate) signature: Signature,
    pub(crate) call: MethodFn,
}

#[derive(Clone)]
pub(crate) struct FaultEntry {
    pub(crate) tag: TypeTag,
    pub(crate) qualified_name: &'static str,
    pub(crate) view: ViewFn,
    pub(crate) into_error: IntoErrorFn,
}

/// Types, methods and faults known to one side of a boundary.
#[derive(Clone)]
pub struct Catalog {
    types: HashMap<TypeId, TypeEntry>,
    tags: HashMap<TypeTag, TypeId>,
    methods: HashMap<MethodId, MethodEntry>,
    faults: Vec<FaultEntry>,
}

macro_rules! core_direct {
    ($catalog:ident; $($ty:ty => $tag:literal),+ $(,)?) => {
        $( $catalog.put_type(TypeId::of::<$ty>(), TypeTag::new($tag), direct_codec::<$ty>()); )+
    };
}

impl Catalog {
    /// A catalog holding the platform's own types: primitives, strings,
    /// byte buffers, a few common collections and the built-in faults.
    #[must_use]
    pub fn new() -> Self {
        let mut catalog = Self::empty();
        core_direct!(catalog;
            () => "unit",
            bool => "bool",
            char => "char",
            i8 => "i8",
            i16 => "i16",
            i32 => "i32",
            i64 => "i64",
            isize => "isize",
            u8 => "u8",
            u16 => "u16",
            u32 => "u32",
            u64 => "u64",
            usize => "usize",
            String => "string",
            Vec<u8> => "bytes",
            Vec<i64> => "vec<i64>",
            Vec<String> => "vec<string>",
            serde_json::Value => "json",
            DivideByZero => "DivideByZero",
            ArgumentError => "ArgumentError",
            InvalidOperation => "InvalidOperation",
            Panicked => "Panicked",
        );
        catalog.put_type(TypeId::of::<f32>(), TypeTag::new("f32"), float_codec::<f32>());
        catalog.put_type(TypeId::of::<f64>(), TypeTag::new("f64"), float_codec::<f64>());
        catalog.put_type(
            TypeId::of::<Vec<f64>>(),
            TypeTag::new("vec<f64>"),
            Codec::Direct { encode: encode_floats, decode: decode_floats },
        );
        catalog.put_fault::<DivideByZero>(TypeTag::new("DivideByZero"));
        catalog.put_fault::<ArgumentError>(TypeTag::new("ArgumentError"));
        catalog.put_fault::<InvalidOperation>(TypeTag::new("InvalidOperation"));
        catalog.put_fault::<Panicked>(TypeTag::new("Panicked"));
        catalog
    }

    /// A catalog that knows nothing, not even primitives.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
            tags: HashMap::new(),
            methods: HashMap::new(),
            faults: Vec::new(),
        }
    }

    /// Register `T` as directly transportable through its serde form.
    ///
    /// # Errors
    /// Returns [`CatalogError::DuplicateType`] if `T` or `tag` is taken.
    pub fn register_direct<T>(&mut self, tag: impl Into<TypeTag>) -> Result<(), CatalogError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let tag = tag.into();
        self.check_type(TypeId::of::<T>(), &tag)?;
        self.put_type(TypeId::of::<T>(), tag, direct_codec::<T>());
        Ok(())
    }

    /// Register `T` to be walked field by field.
    ///
    /// # Errors
    /// Returns [`CatalogError::DuplicateType`] if `T` or its tag is taken.
    pub fn register<T: Marshalable>(&mut self) -> Result<(), CatalogError> {
        let tag = TypeTag::new(T::TYPE_TAG);
        self.check_type(TypeId::of::<T>(), &tag)?;
        let codec = Codec::Composite { write: write_composite::<T>, read: read_composite::<T> };
        self.put_type(TypeId::of::<T>(), tag, codec);
        Ok(())
    }

    /// Register a method of `T` that bound callables may refer to by `id`.
    ///
    /// # Errors
    /// Returns [`CatalogError::UnregisteredType`] if `T` is not registered
    /// and [`CatalogError::DuplicateMethod`] if `id` is taken.
    pub fn register_method<T, S, R, E, F>(
        &mut self,
        id: impl Into<MethodId>,
        method: F,
    ) -> Result<(), CatalogError>
    where
        T: Any + Send,
        S: Any,
        R: Any + Send,
        E: Into<BoxError> + 'static,
        F: Fn(&mut T, S) -> Result<R, E> + Send + Sync + 'static,
    {
        let id = id.into();
        if !self.types.contains_key(&TypeId::of::<T>()) {
            return Err(CatalogError::UnregisteredType { type_name: type_name::<T>().to_owned() });
        }
        if self.methods.contains_key(&id) {
            return Err(CatalogError::DuplicateMethod { method: id });
        }
        let call: MethodFn = Arc::new(move |target: &mut (dyn Any + Send), arg: Option<AnyValue>| {
            let target = target
                .downcast_mut::<T>()
                .ok_or_else(|| {
                    MarshalError::TypeMismatch { expected: type_name::<T>().to_owned() }
                })?;
            let arg = unpack::<S>(arg)?;
            method(target, arg)
                .map(|value| Box::new(value) as AnyValue)
                .map_err(|err| InvokeError::Raised(Raised::new(err)))
        });
        let entry = MethodEntry {
            target: TypeId::of::<T>(),
            target_name: type_name::<T>(),
            signature: Signature::of::<S, R>(),
            call,
        };
        self.methods.insert(id, entry);
        Ok(())
    }

    /// Register `E` as a fault that is rebuilt as itself on the other side.
    ///
    /// `E` must already be registered as a type, so its value can travel
    /// as the fault's detail.
    ///
    /// # Errors
    /// Returns [`CatalogError::UnregisteredType`] if `E` is not registered and
    /// [`CatalogError::DuplicateType`] if it is already a fault.
    pub fn register_fault<E>(&mut self) -> Result<(), CatalogError>
    where
        E: Error + Send + Sync + 'static,
    {
        let tag = self
            .tag_of::<E>()
            .cloned()
            .ok_or_else(|| {
                CatalogError::UnregisteredType { type_name: type_name::<E>().to_owned() }
            })?;
        if self.faults.iter().any(|fault| fault.tag == tag) {
            return Err(CatalogError::DuplicateType { tag });
        }
        self.put_fault::<E>(tag);
        Ok(())
    }

    /// Bind `method` to `target`, producing a callable that crosses the
    /// boundary as a method reference plus a snapshot of `target`.
    ///
    /// # Errors
    /// Returns [`MarshalError::UnknownMethod`] if `method` is not registered
    /// and [`MarshalError::TypeMismatch`] if it belongs to another type.
    pub fn bind<T: Any + Send>(
        &self,
        target: T,
        method: impl Into<MethodId>,
    ) -> Result<Callable, MarshalError> {
        let method = method.into();
        let entry = self
            .method(&method)
            .ok_or_else(|| MarshalError::UnknownMethod { method: method.clone() })?;
        if entry.target != TypeId::of::<T>() {
            return Err(MarshalError::TypeMismatch { expected: entry.target_name.to_owned() });
        }
        Ok(Callable::bound(method, entry, Box::new(target)))
    }

    /// Whether `T` is registered.
    #[must_use]
    pub fn contains<T: Any>(&self) -> bool {
        self.types.contains_key(&TypeId::of::<T>())
    }

    /// Whether a type is registered under `tag`.
    #[must_use]
    pub fn contains_tag(&self, tag: &TypeTag) -> bool {
        self.tags.contains_key(tag)
    }

    /// Whether `method` is registered.
    #[must_use]
    pub fn contains_method(&self, method: &MethodId) -> bool {
        self.methods.contains_key(method)
    }

    /// The tag `T` is registered under.
    #[must_use]
    pub fn tag_of<T: Any>(&self) -> Option<&TypeTag> {
        self.types.get(&TypeId::of::<T>()).map(|entry| &entry.tag)
    }

    /// Number of registered types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub(crate) fn entry_by_id(&self, id: TypeId) -> Option<&TypeEntry> {
        self.types.get(&id)
    }

    pub(crate) fn entry_by_tag(&self, tag: &TypeTag) -> Option<&TypeEntry> {
        self.tags.get(tag).and_then(|id| self.types.get(id))
    }

    pub(crate) fn method(&self, id: &MethodId) -> Option<&MethodEntry> {
        self.methods.get(id)
    }

    /// The registered fault `err` is an instance of, with a view of it as `Any`.
    pub(crate) fn fault_for<'e>(
        &self,
        err: &'e (dyn Error + 'static),
    ) -> Option<(&FaultEntry, &'e dyn Any)> {
        self.faults.iter().find_map(|entry| (entry.view)(err).map(|value| (entry, value)))
    }

    pub(crate) fn fault_by_tag(&self, tag: &TypeTag) -> Option<&FaultEntry> {
        self.faults.iter().find(|entry| &entry.tag == tag)
    }

    fn check_type(&self, id: TypeId, tag: &TypeTag) -> Result<(), CatalogError> {
        if let Some(existing) = self.types.get(&id) {
            return Err(CatalogError::DuplicateType { tag: existing.tag.clone() });
        }
        if self.tags.contains_key(tag) {
            return Err(CatalogError::DuplicateType { tag: tag.clone() });
        }
        Ok(())
    }

    fn put_type(&mut self, id: TypeId, tag: TypeTag, codec: Codec) {
        self.tags.insert(tag.clone(), id);
        self.types.insert(id, TypeEntry { tag, codec });
    }

    fn put_fault<E: Error + Send + Sync + 'static>(&mut self, tag: TypeTag) {
        self.faults.push(FaultEntry {
            tag,
            qualified_name: type_name::<E>(),
            view: view_fault::<E>,
            into_error: box_fault::<E>,
        });
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.tags.keys().map(TypeTag::as_str).collect();
        tags.sort_unstable();
        let mut methods: Vec<_> = self.methods.keys().map(MethodId::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("Catalog")
            .field("types", &tags)
            .field("methods", &methods)
            .field("faults", &self.faults.len())
            .finish()
    }
}

fn direct_codec<T: Serialize + DeserializeOwned + Send + 'static>() -> Codec {
    Codec::Direct { encode: encode_direct::<T>, decode: decode_direct::<T> }
}

// Codec errors carry the Rust type name; the marshaler swaps in the
// registered tag before they leave.
fn encode_direct<T: Serialize + 'static>(
    value: &dyn Any,
) -> Result<serde_json::Value, MarshalError> {
    let value = value
        .downcast_ref::<T>()
        .ok_or_else(|| MarshalError::TypeMismatch { expected: type_name::<T>().to_owned() })?;
    serde_json::to_value(value).map_err(|e| MarshalError::Encode {
        type_tag: TypeTag::new(type_name::<T>()),
        reason: e.to_string(),
    })
}

fn decode_direct<T: DeserializeOwned + Send + 'static>(
    json: serde_json::Value,
) -> Result<AnyValue, MarshalError> {
    serde_json::from_value::<T>(json)
        .map(|value| Box::new(value) as AnyValue)
        .map_err(|e| MarshalError::Decode {
            type_tag: TypeTag::new(type_name::<T>()),
            reason: e.to_string(),
        })
}

/// A float that can take the JSON detour without losing its value.
trait Float: Copy + Send + 'static {
    fn widen(self) -> f64;
    fn narrow(value: f64) -> Self;
}

impl Float for f64 {
    fn widen(self) -> f64 {
        self
    }

    fn narrow(value: f64) -> Self {
        value
    }
}

impl Float for f32 {
    fn widen(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn narrow(value: f64) -> Self {
        value as f32
    }
}

const INFINITY: &str = "inf";
const NEG_INFINITY: &str = "-inf";
const NAN: &str = "NaN";

/// JSON numbers have no infinities or NaN, so those travel as strings.
pub(crate) fn float_to_json(value: f64) -> serde_json::Value {
    if value.is_nan() {
        serde_json::Value::from(NAN)
    } else if value.is_infinite() {
        serde_json::Value::from(if value > 0.0 { INFINITY } else { NEG_INFINITY })
    } else {
        serde_json::Value::from(value)
    }
}

pub(crate) fn float_from_json(json: &serde_json::Value) -> Option<f64> {
    match json {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => match text.as_str() {
            INFINITY => Some(f64::INFINITY),
            NEG_INFINITY => Some(f64::NEG_INFINITY),
            NAN => Some(f64::NAN),
            _ => None,
        },
        _ => None,
    }
}

fn float_codec<F: Float>() -> Codec {
    Codec::Direct { encode: encode_float::<F>, decode: decode_float::<F> }
}

fn encode_float<F: Float>(value: &dyn Any) -> Result<serde_json::Value, MarshalError> {
    value
        .downcast_ref::<F>()
        .map(|value| float_to_json(value.widen()))
        .ok_or_else(|| MarshalError::TypeMismatch { expected: type_name::<F>().to_owned() })
}

fn decode_float<F: Float>(json: serde_json::Value) -> Result<AnyValue, MarshalError> {
    float_from_json(&json)
        .map(|value| Box::new(F::narrow(value)) as AnyValue)
        .ok_or_else(|| MarshalError::Decode {
            type_tag: TypeTag::new(type_name::<F>()),
            reason: format!("expected a float, found {json}"),
        })
}

fn encode_floats(value: &dyn Any) -> Result<serde_json::Value, MarshalError> {
    value
        .downcast_ref::<Vec<f64>>()
        .map(|values| values.iter().copied().map(float_to_json).collect())
        .ok_or_else(|| MarshalError::TypeMismatch { expected: type_name::<Vec<f64>>().to_owned() })
}

fn decode_floats(json: serde_json::Value) -> Result<AnyValue, MarshalError> {
    let decoded = match &json {
        serde_json::Value::Array(items) => {
            items.iter().map(float_from_json).collect::<Option<Vec<f64>>>()
        }
        _ => None,
    };
    decoded.map(|values| Box::new(values) as AnyValue).ok_or_else(|| MarshalError::Decode {
        type_tag: TypeTag::new(type_name::<Vec<f64>>()),
        reason: format!("expected an array of floats, found {json}"),
    })
}

fn write_composite<T: Marshalable>(
    value: &dyn Any,
    fields: &mut FieldWriter<'_>,
) -> Result<(), MarshalError> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| MarshalError::TypeMismatch { expected: type_name::<T>().to_owned() })?
        .write_fields(fields)
}

fn read_composite<T: Marshalable>(fields: &FieldReader<'_>) -> Result<AnyValue, MarshalError> {
    T::read_fields(fields).map(|value| Box::new(value) as AnyValue)
}

fn view_fault<'a, E: Error + 'static>(err: &'a (dyn Error + 'static)) -> Option<&'a dyn Any> {
    err.downcast_ref::<E>().map(|e| e as &dyn Any)
}

fn box_fault<E: Error + Send + Sync + 'static>(value: AnyValue) -> Option<BoxError> {
    value.downcast::<E>().ok().map(|e| e as BoxError)
}

/// A named, replayable registration step.
///
/// The host loads units into its own catalog; every new isolation domain
/// replays them into a fresh one. A loader may return
/// [`CatalogError::Unavailable`] to decline loading in some contexts.
#[derive(Clone)]
pub struct CodeUnit {
    name: String,
    loader: Arc<dyn Fn(&mut Catalog) -> Result<(), CatalogError> + Send + Sync>,
}

impl CodeUnit {
    /// Create a unit named `name` that runs `loader` against each catalog.
    pub fn new<F>(name: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&mut Catalog) -> Result<(), CatalogError> + Send + Sync + 'static,
    {
        Self { name: name.into(), loader: Arc::new(loader) }
    }

    /// The unit's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the loader against `catalog`.
    ///
    /// # Errors
    /// Propagates whatever the loader returns. On error, `catalog` may hold
    /// partial registrations; callers stage loads on a clone.
    pub fn load_into(&self, catalog: &mut Catalog) -> Result<(), CatalogError> {
        (self.loader)(catalog)
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit").field("name", &self.name).finish_non_exhaustive()
    }
}
