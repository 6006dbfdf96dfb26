//! Query keys and their canonical hashes.
//!
//! A [`QueryKey`] is an ordered list of [`KeyValue`]s. Its hash is a canonical,
//! JSON-like rendering with object properties sorted by name, so two keys that
//! only differ in property order share a cache entry:
//!
//! ```
//! use querykit::key::{KeyValue, QueryKey};
//!
//! let a = QueryKey::new(vec![
//!     "todos".into(),
//!     KeyValue::object([("status", "done".into()), ("page", 1.into())]),
//! ])?;
//! let b = QueryKey::new(vec![
//!     "todos".into(),
//!     KeyValue::object([("page", 1.into()), ("status", "done".into())]),
//! ])?;
//! assert_eq!(a.hash(), b.hash());
//! # Ok::<(), querykit::QueryError>(())
//! ```
//!
//! Object properties holding [`KeyValue::Undefined`] are dropped before
//! hashing, while a bare `Undefined` array element is kept and rendered as
//! `undefined` (distinct from `null`).

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use serde_json::{Number, Value};

use crate::error::QueryError;

/// Nesting deeper than this is rejected as not serializable.
pub const MAX_KEY_DEPTH: usize = 128;

/// A single element of a query key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Undefined,
    Null,
    Bool(bool),
    /// Integers are kept exact; non-finite floats become [`KeyValue::Null`].
    Number(Number),
    String(String),
    Array(Vec<KeyValue>),
    /// Properties in insertion order. Order is irrelevant to the hash.
    Object(Vec<(String, KeyValue)>),
}

impl KeyValue {
    /// Builds an object value from `(name, value)` pairs.
    pub fn object<K, I>(props: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, KeyValue)>,
    {
        Self::Object(props.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Looks up an object property, treating `Undefined` as absent.
    pub fn get(&self, name: &str) -> Option<&KeyValue> {
        match self {
            Self::Object(props) => props
                .iter()
                .rev()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v)
                .filter(|v| !matches!(v, Self::Undefined)),
            _ => None,
        }
    }

    fn write_canonical(&self, out: &mut String, depth: usize) -> Result<(), QueryError> {
        if depth > MAX_KEY_DEPTH {
            return Err(QueryError::Serialization(format!(
                "key nesting exceeds {MAX_KEY_DEPTH} levels"
            )));
        }
        match self {
            Self::Undefined => out.push_str("undefined"),
            Self::Null => out.push_str("null"),
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Number(n) => out.push_str(&canonical_number(n)),
            Self::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
            Self::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out, depth + 1)?;
                }
                out.push(']');
            }
            Self::Object(props) => {
                // later duplicates win, undefined properties are absent
                let sorted: BTreeMap<&str, &KeyValue> =
                    props.iter().map(|(k, v)| (k.as_str(), v)).collect();
                out.push('{');
                let mut first = true;
                for (name, value) in sorted {
                    if matches!(value, Self::Undefined) {
                        continue;
                    }
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    out.push_str(&Value::String(name.to_string()).to_string());
                    out.push(':');
                    value.write_canonical(out, depth + 1)?;
                }
                out.push('}');
            }
        }
        Ok(())
    }

    fn from_json(value: Value, depth: usize) -> Result<Self, QueryError> {
        if depth > MAX_KEY_DEPTH {
            return Err(QueryError::Serialization(format!(
                "key nesting exceeds {MAX_KEY_DEPTH} levels"
            )));
        }
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(|v| Self::from_json(v, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| -> Result<(String, KeyValue), QueryError> {
                        Ok((k, Self::from_json(v, depth + 1)?))
                    })
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

/// Largest magnitude below which every integer is exact as an `f64`.
const MAX_SAFE_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

/// Renders a number the way JSON would, with integral floats written as
/// integers so `1.0` and `1` hash alike.
fn canonical_number(n: &Number) -> String {
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < MAX_SAFE_FLOAT_INT => format!("{}", f as i64),
        Some(f) => format!("{f}"),
        None => n.to_string(),
    }
}

/// Partial deep equality: every part of `prefix` must be present in `value`.
///
/// Arrays match when `prefix` is a prefix of `value`; objects match when every
/// defined property of `prefix` matches the same property of `value`.
fn partial_deep_eq(value: &KeyValue, prefix: &KeyValue) -> bool {
    match (value, prefix) {
        (KeyValue::Array(a), KeyValue::Array(b)) => {
            b.len() <= a.len() && a.iter().zip(b).all(|(x, y)| partial_deep_eq(x, y))
        }
        (KeyValue::Object(_), KeyValue::Object(props)) => {
            props.iter().all(|(name, expected)| match expected {
                KeyValue::Undefined => true,
                expected => value
                    .get(name)
                    .is_some_and(|actual| partial_deep_eq(actual, expected)),
            })
        }
        (KeyValue::Number(a), KeyValue::Number(b)) => canonical_number(a) == canonical_number(b),
        (a, b) => a == b,
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for KeyValue {
            fn from(n: $t) -> Self {
                Self::Number(Number::from(n))
            }
        })*
    };
}

impl_from_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl From<f64> for KeyValue {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<f32> for KeyValue {
    fn from(n: f32) -> Self {
        Self::from(f64::from(n))
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for KeyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<KeyValue>> From<Option<T>> for KeyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Undefined, Into::into)
    }
}

impl<T: Into<KeyValue>> From<Vec<T>> for KeyValue {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

/// Computes the canonical hash of a key.
///
/// # Errors
///
/// Returns [`QueryError::Serialization`] if the key nests deeper than
/// [`MAX_KEY_DEPTH`].
pub fn hash_key(parts: &[KeyValue]) -> Result<String, QueryError> {
    let mut out = String::new();
    out.push('[');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        part.write_canonical(&mut out, 1)?;
    }
    out.push(']');
    Ok(out)
}

/// Returns `true` if `key` starts with `prefix`, comparing objects as subsets.
pub fn partial_match_key(key: &QueryKey, prefix: &QueryKey) -> bool {
    prefix.parts.len() <= key.parts.len()
        && key
            .parts
            .iter()
            .zip(&prefix.parts)
            .all(|(a, b)| partial_deep_eq(a, b))
}

/// The identity of a cached query.
///
/// Equality and hashing use the canonical hash, so keys that differ only in
/// object property order are equal.
#[derive(Debug, Clone)]
pub struct QueryKey {
    parts: Vec<KeyValue>,
    hash: String,
}

impl QueryKey {
    /// Creates a key from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Serialization`] if the key nests too deeply.
    pub fn new(parts: Vec<KeyValue>) -> Result<Self, QueryError> {
        let hash = hash_key(&parts)?;
        Ok(Self { parts, hash })
    }

    /// Creates a key from any serializable value.
    ///
    /// A top-level array becomes the list of key parts; any other value becomes
    /// a single-part key.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Serialization`] if the value fails to serialize
    /// (for example a map with non-string keys) or nests too deeply.
    pub fn from_serialize<S: Serialize + ?Sized>(value: &S) -> Result<Self, QueryError> {
        let json = serde_json::to_value(value)
            .map_err(|e| QueryError::Serialization(e.to_string()))?;
        let parts = match KeyValue::from_json(json, 0)? {
            KeyValue::Array(items) => items,
            single => vec![single],
        };
        Self::new(parts)
    }

    /// The key parts in order.
    pub fn parts(&self) -> &[KeyValue] {
        &self.parts
    }

    /// The canonical hash identifying the cache entry.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        let parts = vec![KeyValue::from(s)];
        let hash = format!("[{}]", Value::String(s.to_string()));
        Self { parts, hash }
    }
}

impl From<String> for QueryKey {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl TryFrom<Vec<KeyValue>> for QueryKey {
    type Error = QueryError;

    fn try_from(parts: Vec<KeyValue>) -> Result<Self, Self::Error> {
        Self::new(parts)
    }
}
