//! Tagged-union value type for pool specifications.
//!
//! Pool definitions are heterogeneous attribute maps (`cpu: 4000`,
//! `drivers: [docker]`, `provider: {name: karpenter, params: {...}}`). A
//! [`Variant`] holds any of those values and can be hashed structurally so two
//! definitions with the same shape produce the same fingerprint.
//!
//! Maps are stored in a [`BTreeMap`], so iteration and hashing never depend on
//! the order keys appeared in the source document.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, Result};

/// A configuration value: int, bool, string, list or map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
    /// Ordered list.
    List(Vec<Variant>),
    /// String-keyed map.
    Map(BTreeMap<String, Variant>),
}

impl Variant {
    /// Name of the value's type, for error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Integer value, if this is an int.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean value, if this is a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// List items, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Variant]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Map entries, if this is a map.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Variant>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable map entries, if this is a map.
    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Variant>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable list items, if this is a list.
    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Variant>> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Require an int, naming `key` in the error.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VariantType`] if the value is not an int.
    pub fn expect_int(&self, key: &str) -> Result<i64> {
        self.as_int()
            .ok_or_else(|| CoreError::variant_type(key, "int", self.kind()))
    }

    /// Require a string, naming `key` in the error.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VariantType`] if the value is not a string.
    pub fn expect_str(&self, key: &str) -> Result<&str> {
        self.as_str()
            .ok_or_else(|| CoreError::variant_type(key, "string", self.kind()))
    }

    /// Require a map, naming `key` in the error.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VariantType`] if the value is not a map.
    pub fn expect_map(&self, key: &str) -> Result<&BTreeMap<String, Variant>> {
        self.as_map()
            .ok_or_else(|| CoreError::variant_type(key, "map", self.kind()))
    }

    /// Render a scalar as the string a node attribute would carry.
    ///
    /// Lists and maps have no scalar form and return `None`.
    #[must_use]
    pub fn to_scalar_string(&self) -> Option<String> {
        match self {
            Self::Int(v) => Some(v.to_string()),
            Self::Bool(v) => Some(v.to_string()),
            Self::Str(v) => Some(v.clone()),
            Self::List(_) | Self::Map(_) => None,
        }
    }

    /// Feed the value's structure into `hasher`.
    ///
    /// Every value is prefixed with a type tag and every variable-length
    /// component with its length, so distinct structures never produce the
    /// same byte stream.
    pub fn hash_into(&self, hasher: &mut blake3::Hasher) {
        match self {
            Self::Int(v) => {
                hasher.update(b"i");
                hasher.update(&v.to_le_bytes());
            }
            Self::Bool(v) => {
                hasher.update(b"b");
                hasher.update(&[u8::from(*v)]);
            }
            Self::Str(v) => {
                hasher.update(b"s");
                hash_bytes(hasher, v.as_bytes());
            }
            Self::List(items) => {
                hasher.update(b"l");
                hasher.update(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.hash_into(hasher);
                }
            }
            Self::Map(entries) => {
                hasher.update(b"m");
                hasher.update(&(entries.len() as u64).to_le_bytes());
                for (key, value) in entries {
                    hash_bytes(hasher, key.as_bytes());
                    value.hash_into(hasher);
                }
            }
        }
    }

    /// Structural fingerprint of the value.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        self.hash_into(&mut hasher);
        *hasher.finalize().as_bytes()
    }
}

fn hash_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(v: Vec<Variant>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, Variant>> for Variant {
    fn from(v: BTreeMap<String, Variant>) -> Self {
        Self::Map(v)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Str(v) => serializer.serialize_str(v),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct VariantVisitor;

impl<'de> Visitor<'de> for VariantVisitor {
    type Value = Variant;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an int, bool, string, list or map")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Variant, E> {
        Ok(Variant::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Variant, E> {
        Ok(Variant::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Variant, E> {
        i64::try_from(v)
            .map(Variant::Int)
            .map_err(|_| E::custom(format!("integer {v} out of range")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Variant, E> {
        Err(E::custom(format!(
            "floating point value {v} is not supported, use an integer or a string"
        )))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Variant, E> {
        Ok(Variant::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Variant, E> {
        Ok(Variant::Str(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Variant, E> {
        Err(E::custom("null values are not supported"))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Variant, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Variant::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Variant, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<String, Variant>()? {
            entries.insert(key, value);
        }
        Ok(Variant::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(VariantVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Variant)]) -> Variant {
        Variant::Map(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn accessors() {
        assert_eq!(Variant::Int(3).as_int(), Some(3));
        assert_eq!(Variant::Bool(true).as_bool(), Some(true));
        assert_eq!(Variant::from("x").as_str(), Some("x"));
        assert!(Variant::Int(3).as_str().is_none());
        assert_eq!(Variant::List(vec![]).kind(), "list");
    }

    #[test]
    fn expect_reports_key_and_types() {
        let err = Variant::from("4GB").expect_int("mem").unwrap_err();
        assert!(err.to_string().contains("mem"));
        assert!(err.to_string().contains("expected int"));
    }

    #[test]
    fn fingerprint_ignores_source_key_order() {
        let a: Variant = serde_yaml::from_str("{a: 1, b: [x, y], c: {d: true}}").unwrap();
        let b: Variant = serde_yaml::from_str("{c: {d: true}, b: [x, y], a: 1}").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_types() {
        assert_ne!(
            Variant::Int(1).fingerprint(),
            Variant::from("1").fingerprint()
        );
        assert_ne!(
            Variant::Bool(true).fingerprint(),
            Variant::from("true").fingerprint()
        );
    }

    #[test]
    fn fingerprint_distinguishes_list_order() {
        let a = Variant::List(vec!["a".into(), "b".into()]);
        let b = Variant::List(vec!["b".into(), "a".into()]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_is_not_fooled_by_concatenation() {
        let a = map(&[("ab", "c".into())]);
        let b = map(&[("a", "bc".into())]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn deserialize_nested_yaml() {
        let yaml = "
cpu: 4000
drivers: [docker, exec]
provider:
  name: anynode
enabled: true
";
        let v: Variant = serde_yaml::from_str(yaml).unwrap();
        let m = v.as_map().unwrap();
        assert_eq!(m["cpu"], Variant::Int(4000));
        assert_eq!(m["drivers"].as_list().unwrap().len(), 2);
        assert_eq!(m["enabled"], Variant::Bool(true));
        assert_eq!(
            m["provider"].as_map().unwrap()["name"],
            Variant::from("anynode")
        );
    }

    #[test]
    fn deserialize_rejects_float_and_null() {
        assert!(serde_yaml::from_str::<Variant>("cpu: 1.5").is_err());
        assert!(serde_yaml::from_str::<Variant>("cpu: ~").is_err());
    }

    #[test]
    fn serialize_roundtrips_through_json() {
        let v = map(&[
            ("name", "karpenter".into()),
            ("params", map(&[("reqs", Variant::List(vec![1i64.into()]))])),
        ]);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["params"]["reqs"][0], 1);
        let back: Variant = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn display_renders_compactly() {
        let v = map(&[("a", Variant::List(vec![1i64.into(), "x".into()]))]);
        assert_eq!(v.to_string(), "{a: [1, x]}");
    }

    #[test]
    fn scalar_string() {
        assert_eq!(Variant::Int(5).to_scalar_string().as_deref(), Some("5"));
        assert_eq!(
            Variant::Bool(false).to_scalar_string().as_deref(),
            Some("false")
        );
        assert!(Variant::List(vec![]).to_scalar_string().is_none());
    }
}
