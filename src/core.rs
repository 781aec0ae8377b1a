use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::CacheError;

/// A type-erased, thread-safe container for property values.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for names and paths.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// The bound every declared property type must satisfy.
///
/// `Hash` feeds the input fingerprint used by the result cache, and the serde
/// bounds allow output values to be snapshotted to and restored from the
/// cache file. The trait is blanket-implemented; plain data types such as
/// `String`, `PathBuf`, numbers, and `Vec`s of those qualify automatically.
pub trait PropertyValue:
    Any + Send + Sync + Debug + Hash + Serialize + DeserializeOwned
{
}

impl<T> PropertyValue for T where
    T: Any + Send + Sync + Debug + Hash + Serialize + DeserializeOwned
{
}

/// A 32-byte BLAKE3 hash used for fingerprinting and change detection.
///
/// It acts as the unique fingerprint for a task's resolved input values,
/// deciding whether a prior cached run can be reused instead of executing
/// the task again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes any value through its `Hash` impl, using BLAKE3 as the hasher.
    pub(crate) fn of(value: &impl Hash) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// An adapter exposing BLAKE3 through the `std::hash::Hasher` interface, so
/// that any `Hash` type can be folded into a [`Hash32`].
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// A resolved property value: the type-erased data plus its BLAKE3 hash.
///
/// The hash is computed once, at the moment the concrete type is still known,
/// and travels with the value so the cache never has to re-derive it from the
/// erased form.
#[derive(Clone)]
pub(crate) struct Value {
    pub(crate) data: Dynamic,
    pub(crate) hash: Hash32,
}

impl Value {
    pub(crate) fn new<T: PropertyValue>(value: T) -> Self {
        let hash = Hash32::of(&value);
        Self {
            data: Arc::new(value),
            hash,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value").field("hash", &self.hash).finish()
    }
}

/// Monomorphized helpers for one declared property type, captured when the
/// property is declared. This is what lets the cache encode and decode
/// type-erased values without runtime reflection.
#[derive(Clone, Copy)]
pub(crate) struct ValueVtable {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) encode: fn(&Value) -> Result<Vec<u8>, CacheError>,
    pub(crate) decode: fn(&[u8]) -> Result<Value, CacheError>,
}

impl ValueVtable {
    pub(crate) fn of<T: PropertyValue>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            encode: encode_value::<T>,
            decode: decode_value::<T>,
        }
    }
}

impl Debug for ValueVtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueVtable")
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn encode_value<T: PropertyValue>(value: &Value) -> Result<Vec<u8>, CacheError> {
    let concrete = value
        .data
        .downcast_ref::<T>()
        .expect("value type was checked when the property was wired");
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(concrete, &mut buffer)
        .map_err(|err| CacheError::Encode(err.to_string()))?;
    Ok(buffer)
}

fn decode_value<T: PropertyValue>(bytes: &[u8]) -> Result<Value, CacheError> {
    let concrete: T = ciborium::de::from_reader(bytes)
        .map_err(|err| CacheError::Decode(err.to_string()))?;
    Ok(Value::new(concrete))
}
