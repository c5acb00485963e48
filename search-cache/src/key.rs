use crate::error::EncodingError;
use serde::ser::{self, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Length in bytes of every [`CacheKey`]
pub const KEY_LEN: usize = 32;

// Bumped whenever the canonical encoding changes so old and new keys never mix
const ENCODING_TAG: &[u8] = b"search-cache/key/v1";

/// Opaque, fixed-length identifier of a request
///
/// Two requests with the same semantic parameters always map to the same key.
/// Keys are never decoded back into parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Stable index used to pick a store shard
    pub(crate) fn shard_index(&self, shards: usize) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        (u64::from_le_bytes(prefix) % shards as u64) as usize
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}

/// Derives cache keys from request parameters
///
/// Parameters are serialized with serde, canonicalized (object members
/// sorted by name, `null` members dropped) and hashed with SHA-256.
/// NaN and infinite floats are rejected, since JSON has no way to tell them
/// apart from a missing value.
/// Collections whose order carries no meaning, and free text that should
/// ignore case, can opt into normalization with the helpers in
/// [`canonical`].
pub struct KeyCodec;

impl KeyCodec {
    /// Encode `params` into a key
    pub fn encode<P>(params: &P) -> Result<CacheKey, EncodingError>
    where
        P: Serialize + ?Sized,
    {
        Self::encode_scoped("", params)
    }

    /// Encode `params` into a key that can only collide with keys of the same `scope`
    pub fn encode_scoped<P>(scope: &str, params: &P) -> Result<CacheKey, EncodingError>
    where
        P: Serialize + ?Sized,
    {
        ensure_finite(params)?;
        let canonical = canonicalize(serde_json::to_value(params)?).unwrap_or(Value::Null);
        let body = serde_json::to_vec(&canonical)?;

        let mut hasher = Sha256::new();
        hasher.update(ENCODING_TAG);
        hasher.update((scope.len() as u64).to_le_bytes());
        hasher.update(scope.as_bytes());
        hasher.update(&body);

        let key = CacheKey(hasher.finalize().into());
        log::trace!("Encoded cache key {} (scope {:?})", key, scope);
        Ok(key)
    }
}

fn canonicalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(Value::Array(
            items
                .into_iter()
                .map(|item| canonicalize(item).unwrap_or(Value::Null))
                .collect(),
        )),
        Value::Object(members) => {
            let sorted: BTreeMap<String, Value> = members
                .into_iter()
                .filter_map(|(name, member)| canonicalize(member).map(|member| (name, member)))
                .collect();
            Some(Value::Object(sorted.into_iter().collect::<Map<_, _>>()))
        }
        scalar => Some(scalar),
    }
}

fn ensure_finite<P>(params: &P) -> Result<(), EncodingError>
where
    P: Serialize + ?Sized,
{
    match params.serialize(&mut FiniteCheck) {
        Err(FiniteCheckError::NonFinite(number)) => Err(EncodingError::NonFiniteNumber(number)),
        // Any other failure resurfaces from serde_json with its own message
        _ => Ok(()),
    }
}

/// Serializer that produces nothing and fails on the first NaN or infinity
struct FiniteCheck;

#[derive(Debug)]
enum FiniteCheckError {
    NonFinite(f64),
    Custom(String),
}

impl fmt::Display for FiniteCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiniteCheckError::NonFinite(number) => write!(f, "non-finite number {}", number),
            FiniteCheckError::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for FiniteCheckError {}

impl ser::Error for FiniteCheckError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        FiniteCheckError::Custom(msg.to_string())
    }
}

impl<'a> Serializer for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _v: bool) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_i8(self, _v: i8) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_i16(self, _v: i16) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_i32(self, _v: i32) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_i64(self, _v: i64) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_i128(self, _v: i128) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_u8(self, _v: u8) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_u16(self, _v: u16) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_u32(self, _v: u32) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_u64(self, _v: u64) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_u128(self, _v: u128) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_f32(self, v: f32) -> Result<(), FiniteCheckError> {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<(), FiniteCheckError> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(FiniteCheckError::NonFinite(v))
        }
    }

    fn serialize_char(self, _v: char) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_str(self, _v: &str) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_some<T>(self, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), FiniteCheckError> {
        Ok(())
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, FiniteCheckError> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, FiniteCheckError> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, FiniteCheckError> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, FiniteCheckError> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, FiniteCheckError> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, FiniteCheckError> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, FiniteCheckError> {
        Ok(self)
    }
}

impl<'a> ser::SerializeSeq for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTuple for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleStruct for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleVariant for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }
}

impl<'a> ser::SerializeMap for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        key.serialize(&mut **self)
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;

    fn serialize_field<T>(&mut self, _key: &'static str, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }
}

impl<'a> ser::SerializeStructVariant for &'a mut FiniteCheck {
    type Ok = ();
    type Error = FiniteCheckError;

    fn serialize_field<T>(&mut self, _key: &'static str, value: &T) -> Result<(), FiniteCheckError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), FiniteCheckError> {
        Ok(())
    }
}

/// `serialize_with` helpers that normalize fields before they are hashed
pub mod canonical {
    use serde::{Serialize, Serializer};

    /// Serialize a collection in sorted order, without duplicates
    ///
    /// Use for sets such as the providers a search is scoped to, where
    /// `{a, b}` and `{b, a}` must produce the same key.
    pub fn sorted<'a, C, T, S>(items: &'a C, serializer: S) -> Result<S::Ok, S::Error>
    where
        &'a C: IntoIterator<Item = &'a T>,
        T: Serialize + Ord + 'a,
        S: Serializer,
    {
        let mut items: Vec<&'a T> = items.into_iter().collect();
        items.sort();
        items.dedup();
        serializer.collect_seq(items)
    }

    /// Serialize text trimmed, whitespace-collapsed and lowercased
    pub fn normalized_text<S>(text: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&normalize(text))
    }

    pub(crate) fn normalize(text: &str) -> String {
        text.split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
