//! # UBL Atom
//!
//! Canonical JSON serialization for deterministic hashing.
//!
//! ## Guarantees
//! - Semantically equal JSON documents produce identical bytes
//! - Object keys sorted by UTF-8 byte order (recursive)
//! - Strings are NFC-normalized
//! - Numbers render as shortest decimal, never scientific notation; `-0`
//!   collapses to `0`
//! - Duplicate object keys are rejected, not silently overwritten
//! - No whitespace in output; NaN/Infinity are rejected
//!
//! ## Example
//! ```
//! use ubl_atom::canonicalize_str;
//!
//! let canonical = canonicalize_str(r#"{"z": 1, "a": 2}"#).unwrap();
//! assert_eq!(canonical, br#"{"a":2,"z":1}"#);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashSet;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Number, Value};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Errors that can occur during canonicalization.
#[derive(Error, Debug)]
pub enum AtomError {
    /// Malformed or duplicate-key JSON input.
    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// NaN or Infinity, neither of which has a canonical JSON form.
    #[error("non-finite number")]
    NonFiniteNumber,
}

/// Result type for atom operations.
pub type Result<T> = std::result::Result<T, AtomError>;

/// A parsed JSON value that remembers enough to canonicalize faithfully:
/// unlike [`serde_json::Value`], building one from raw text rejects
/// duplicate object keys instead of silently keeping the last write.
#[derive(Clone, Debug)]
enum AVal {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<AVal>),
    Object(Vec<(String, AVal)>),
}

impl<'de> Deserialize<'de> for AVal {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(AValVisitor)
    }
}

struct AValVisitor;

impl<'de> Visitor<'de> for AValVisitor {
    type Value = AVal;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> std::result::Result<AVal, E> {
        Ok(AVal::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> std::result::Result<AVal, E> {
        Ok(AVal::Number(Number::from(v)))
    }

    fn visit_u64<E>(self, v: u64) -> std::result::Result<AVal, E> {
        Ok(AVal::Number(Number::from(v)))
    }

    fn visit_f64<E>(self, v: f64) -> std::result::Result<AVal, E>
    where
        E: de::Error,
    {
        if v.is_nan() || v.is_infinite() {
            return Err(E::custom("non-finite number"));
        }
        Number::from_f64(v)
            .map(AVal::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<AVal, E> {
        Ok(AVal::String(v.nfc().collect()))
    }

    fn visit_string<E>(self, v: String) -> std::result::Result<AVal, E> {
        Ok(AVal::String(v.nfc().collect()))
    }

    fn visit_unit<E>(self) -> std::result::Result<AVal, E> {
        Ok(AVal::Null)
    }

    fn visit_none<E>(self) -> std::result::Result<AVal, E> {
        Ok(AVal::Null)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<AVal, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<AVal>()? {
            items.push(item);
        }
        Ok(AVal::Array(items))
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<AVal, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut seen = HashSet::new();
        let mut pairs = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, AVal>()? {
            let key: String = key.nfc().collect();
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format!("duplicate object key: {key}")));
            }
            pairs.push((key, value));
        }
        Ok(AVal::Object(pairs))
    }
}

fn avalue_from_value(value: &Value) -> AVal {
    match value {
        Value::Null => AVal::Null,
        Value::Bool(b) => AVal::Bool(*b),
        Value::Number(n) => AVal::Number(n.clone()),
        Value::String(s) => AVal::String(s.nfc().collect()),
        Value::Array(arr) => AVal::Array(arr.iter().map(avalue_from_value).collect()),
        Value::Object(map) => AVal::Object(
            map.iter()
                .map(|(k, v)| (k.nfc().collect(), avalue_from_value(v)))
                .collect(),
        ),
    }
}

/// Format a JSON number canonically: shortest round-trip decimal, never
/// scientific notation, `-0` collapsed to `0`.
fn format_number(n: &Number) -> Result<String> {
    if let Some(i) = n.as_i64() {
        return Ok(i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Ok(u.to_string());
    }
    let f = n.as_f64().ok_or(AtomError::NonFiniteNumber)?;
    if f.is_nan() || f.is_infinite() {
        return Err(AtomError::NonFiniteNumber);
    }
    if f == 0.0 {
        return Ok("0".to_string());
    }
    // Rust's float Display is shortest round-trip and never emits an
    // exponent, which is exactly the canonical form required here.
    Ok(format!("{f}"))
}

fn write_json_string(s: &str, out: &mut Vec<u8>) -> Result<()> {
    let encoded = serde_json::to_vec(&Value::String(s.to_string()))?;
    out.extend_from_slice(&encoded);
    Ok(())
}

fn write_value(value: &AVal, out: &mut Vec<u8>) -> Result<()> {
    match value {
        AVal::Null => out.extend_from_slice(b"null"),
        AVal::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        AVal::Number(n) => out.extend_from_slice(format_number(n)?.as_bytes()),
        AVal::String(s) => write_json_string(s, out)?,
        AVal::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        AVal::Object(pairs) => {
            let mut sorted: Vec<&(String, AVal)> = pairs.iter().collect();
            sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_json_string(k, out)?;
                out.push(b':');
                write_value(v, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// Canonicalize raw JSON text. Rejects duplicate object keys at any
/// nesting level and trailing garbage after the top-level value.
pub fn canonicalize_str(json_text: &str) -> Result<Vec<u8>> {
    let mut de = serde_json::Deserializer::from_str(json_text);
    let value = AVal::deserialize(&mut de)?;
    de.end()?;
    let mut out = Vec::new();
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Canonicalize an already-parsed [`serde_json::Value`]. Duplicate keys
/// cannot be detected here: `Value`'s own parser has already collapsed
/// them to the last write. Prefer [`canonicalize_str`] when the raw text
/// is available.
pub fn canonicalize_value(value: &Value) -> Result<Vec<u8>> {
    let aval = avalue_from_value(value);
    let mut out = Vec::new();
    write_value(&aval, &mut out)?;
    Ok(out)
}

/// Canonicalize to a `String` (debugging/display only).
pub fn canonicalize_string(value: &Value) -> Result<String> {
    let bytes = canonicalize_value(value)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Compute `atom_hash = BLAKE3(canonical_bytes)` from raw JSON text.
pub fn atom_hash(json_text: &str) -> Result<ubl_kernel::Hash> {
    let canonical = canonicalize_str(json_text)?;
    Ok(ubl_kernel::hash_atom(&canonical))
}

/// Compute `atom_hash` from an already-parsed value.
pub fn atom_hash_value(value: &Value) -> Result<ubl_kernel::Hash> {
    let canonical = canonicalize_value(value)?;
    Ok(ubl_kernel::hash_atom(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys() {
        let out = canonicalize_str(r#"{"z": 1, "a": 2, "m": 3}"#).unwrap();
        assert_eq!(out, br#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn sorts_nested_keys() {
        let out = canonicalize_str(r#"{"outer": {"z": 1, "a": 2}, "array": [{"b": 1, "a": 2}]}"#).unwrap();
        assert_eq!(out, br#"{"array":[{"a":2,"b":1}],"outer":{"a":2,"z":1}}"#);
    }

    #[test]
    fn preserves_array_order() {
        let out = canonicalize_str("[3,1,2]").unwrap();
        assert_eq!(out, b"[3,1,2]");
    }

    #[test]
    fn deterministic_across_key_order() {
        let a = canonicalize_str(r#"{"b": 2, "a": 1}"#).unwrap();
        let b = canonicalize_str(r#"{"a": 1, "b": 2}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn no_whitespace() {
        let out = canonicalize_str(r#"{"key": "value", "nested": {"a": 1}}"#).unwrap();
        assert!(!out.contains(&b' '));
        assert!(!out.contains(&b'\n'));
    }

    #[test]
    fn rejects_duplicate_keys() {
        let err = canonicalize_str(r#"{"a": 1, "a": 2}"#).unwrap_err();
        assert!(matches!(err, AtomError::Parse(_)));
    }

    #[test]
    fn rejects_duplicate_keys_nested() {
        let err = canonicalize_str(r#"{"outer": {"x": 1, "x": 2}}"#).unwrap_err();
        assert!(matches!(err, AtomError::Parse(_)));
    }

    #[test]
    fn negative_zero_collapses_to_zero() {
        let out = canonicalize_str(r#"{"n": -0.0}"#).unwrap();
        assert_eq!(out, br#"{"n":0}"#);
    }

    #[test]
    fn integral_float_has_no_trailing_point() {
        let out = canonicalize_str(r#"{"n": 2.0}"#).unwrap();
        assert_eq!(out, br#"{"n":2}"#);
    }

    #[test]
    fn no_scientific_notation_for_large_numbers() {
        let out = canonicalize_str(r#"{"n": 1e21}"#).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains('e') && !s.contains('E'));
    }

    #[test]
    fn strings_are_nfc_normalized() {
        // "é" as 'e' + combining acute accent (NFD) must canonicalize the
        // same as the precomposed form (NFC).
        let nfd = canonicalize_str("\"e\u{0301}\"").unwrap();
        let nfc = canonicalize_str("\"\u{00e9}\"").unwrap();
        assert_eq!(nfd, nfc);
    }

    #[test]
    fn atom_hash_matches_canonical_bytes() {
        let canonical = canonicalize_str(r#"{"a": 1, "b": [2, 3]}"#).unwrap();
        let expected = ubl_kernel::hash_atom(&canonical);
        assert_eq!(atom_hash(r#"{"a": 1, "b": [2, 3]}"#).unwrap(), expected);
    }

    #[test]
    fn atom_hash_deterministic_across_key_order() {
        let h1 = atom_hash(r#"{"z": 1, "a": 2}"#).unwrap();
        let h2 = atom_hash(r#"{"a": 2, "z": 1}"#).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn canonicalize_value_matches_str_for_simple_docs() {
        let v = json!({"a": 1, "b": "x"});
        let from_value = canonicalize_value(&v).unwrap();
        let from_str = canonicalize_str(r#"{"a":1,"b":"x"}"#).unwrap();
        assert_eq!(from_value, from_str);
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(canonicalize_str(r#"{"a":1} garbage"#).is_err());
    }

    /// Property-based checks for the invariants §8 quantifies over "all
    /// canonicalization inputs" rather than a handful of fixed cases.
    mod properties {
        use super::*;
        use quickcheck_macros::quickcheck;

        fn object_from_pairs(pairs: &[(String, i64)]) -> Value {
            let map: serde_json::Map<String, Value> = pairs
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(*v)))
                .collect();
            Value::Object(map)
        }

        #[quickcheck]
        fn canonicalization_is_independent_of_key_order(
            mut keys: Vec<String>,
            values: Vec<i64>,
        ) -> bool {
            keys.truncate(values.len());
            let values: Vec<i64> = values.into_iter().take(keys.len()).collect();
            let mut pairs: Vec<(String, i64)> =
                keys.into_iter().zip(values).collect::<std::collections::HashMap<_, _>>().into_iter().collect();
            if pairs.is_empty() {
                return true;
            }
            let forward = object_from_pairs(&pairs);
            pairs.reverse();
            let reversed = object_from_pairs(&pairs);

            let a = canonicalize_value(&forward).unwrap();
            let b = canonicalize_value(&reversed).unwrap();
            a == b
        }

        #[quickcheck]
        fn canonicalization_is_idempotent(keys: Vec<String>, values: Vec<i64>) -> bool {
            let n = keys.len().min(values.len());
            let pairs: Vec<(String, i64)> = keys
                .into_iter()
                .zip(values)
                .take(n)
                .collect::<std::collections::HashMap<_, _>>()
                .into_iter()
                .collect();
            let value = object_from_pairs(&pairs);

            let once = canonicalize_value(&value).unwrap();
            let text = String::from_utf8(once.clone()).unwrap();
            let twice = canonicalize_str(&text).unwrap();
            once == twice
        }
    }
}
