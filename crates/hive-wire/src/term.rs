//! Runtime value type and its tagged-JSON codec.
//!
//! User payloads and server state are [`Term`]s. A `Term` is richer than plain
//! JSON: it distinguishes absent values, timestamps, binary blobs, error
//! objects, arbitrary-precision integers, ordered keyed maps, unordered sets,
//! and regular expressions. Each non-native kind encodes as a JSON object
//! carrying the reserved marker property with a type tag and a `value` sibling
//! holding the type-specific representation.
//!
//! Term trees are acyclic by construction; the encoder additionally enforces a
//! recursion depth cap so a pathologically deep value fails with an explicit
//! error instead of exhausting the stack.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Number, Value};
use thiserror::Error;

/// Reserved marker property identifying a tagged special value.
pub const TYPE_MARKER: &str = "__noex_type__";

/// Maximum nesting depth accepted by the codec.
const MAX_DEPTH: usize = 128;

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Value nesting exceeds the depth cap.
    #[error("value nesting exceeds {0} levels")]
    DepthExceeded(usize),
    /// A user object uses the reserved type-marker key.
    #[error("object key '{}' is reserved", TYPE_MARKER)]
    ReservedKey,
    /// A float is NaN or infinite and cannot be represented in JSON.
    #[error("non-finite float cannot be encoded")]
    NonFiniteNumber,
    /// A BigInt payload is not a decimal integer literal.
    #[error("malformed BigInt literal '{0}'")]
    MalformedBigInt(String),
    /// A tagged value names an unknown type.
    #[error("unknown special-type tag '{0}'")]
    UnknownTag(String),
    /// A tagged value's payload does not match its tag.
    #[error("malformed '{tag}' payload: {reason}")]
    MalformedSpecial { tag: String, reason: String },
    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(String),
    /// A frame payload exceeds the 16 MiB limit.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    /// A framed length prefix exceeds the 16 MiB limit.
    #[error("frame length {len} exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    /// An envelope carried an unsupported protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    /// A secret is configured but the inbound envelope is unsigned.
    #[error("unsigned envelope rejected: signing is required")]
    SignatureMissing,
    /// The envelope signature did not verify.
    #[error("envelope signature mismatch")]
    SignatureMismatch,
    /// The signature field is not valid hex.
    #[error("envelope signature is not valid hex")]
    MalformedSignature,
}

// ---------------------------------------------------------------------------
// Term
// ---------------------------------------------------------------------------

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// JSON `null`.
    Null,
    /// An absent value, distinct from `null`.
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision integer, carried as its decimal literal.
    BigInt(String),
    Str(String),
    /// Opaque binary blob.
    Bytes(Vec<u8>),
    /// Wall-clock instant, milliseconds since the Unix epoch.
    Timestamp(i64),
    /// A regular expression pattern with flags; transported, never compiled.
    Regex { source: String, flags: String },
    /// A structured error value.
    Error(Box<ErrorTerm>),
    List(Vec<Term>),
    /// Unordered collection of distinct values.
    Set(Vec<Term>),
    /// Keyed map whose keys may be arbitrary terms; insertion order preserved.
    Map(Vec<(Term, Term)>),
    /// String-keyed record.
    Object(BTreeMap<String, Term>),
}

/// The payload of [`Term::Error`]: name, message, optional stack, and an
/// optional nested cause.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTerm {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Term>,
}

impl ErrorTerm {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorTerm {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }
}

impl Term {
    /// Build an [`Term::Object`] from key/value pairs.
    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Term)>) -> Term {
        Term::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a [`Term::Str`].
    pub fn str(s: impl Into<String>) -> Term {
        Term::Str(s.into())
    }

    /// Build a [`Term::Error`] with just a name and message.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Term {
        Term::Error(Box::new(ErrorTerm::new(name, message)))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Term::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Field access on an [`Term::Object`]; `None` for other variants.
    pub fn get(&self, key: &str) -> Option<&Term> {
        match self {
            Term::Object(map) => map.get(key),
            _ => None,
        }
    }
}

impl Default for Term {
    fn default() -> Term {
        Term::Null
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Term {
        Term::Int(v)
    }
}

impl From<bool> for Term {
    fn from(v: bool) -> Term {
        Term::Bool(v)
    }
}

impl From<&str> for Term {
    fn from(v: &str) -> Term {
        Term::Str(v.to_string())
    }
}

impl From<String> for Term {
    fn from(v: String) -> Term {
        Term::Str(v)
    }
}

impl From<f64> for Term {
    fn from(v: f64) -> Term {
        Term::Float(v)
    }
}

impl From<Vec<Term>> for Term {
    fn from(v: Vec<Term>) -> Term {
        Term::List(v)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match encode(self) {
            Ok(value) => write!(f, "{}", value),
            Err(_) => write!(f, "<unencodable term>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a term into its tagged JSON representation.
pub fn encode(term: &Term) -> Result<Value, CodecError> {
    encode_at(term, 0)
}

fn tagged(tag: &str, value: Value) -> Value {
    let mut map = JsonMap::new();
    map.insert(TYPE_MARKER.to_string(), Value::String(tag.to_string()));
    map.insert("value".to_string(), value);
    Value::Object(map)
}

fn encode_at(term: &Term, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthExceeded(MAX_DEPTH));
    }
    match term {
        Term::Null => Ok(Value::Null),
        Term::Undefined => {
            let mut map = JsonMap::new();
            map.insert(TYPE_MARKER.to_string(), Value::String("undefined".into()));
            Ok(Value::Object(map))
        }
        Term::Bool(b) => Ok(Value::Bool(*b)),
        Term::Int(i) => Ok(Value::Number((*i).into())),
        Term::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or(CodecError::NonFiniteNumber),
        Term::BigInt(digits) => {
            let body = digits.strip_prefix('-').unwrap_or(digits);
            if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit()) {
                return Err(CodecError::MalformedBigInt(digits.clone()));
            }
            Ok(tagged("BigInt", Value::String(digits.clone())))
        }
        Term::Str(s) => Ok(Value::String(s.clone())),
        Term::Bytes(bytes) => Ok(tagged("Bytes", Value::String(BASE64.encode(bytes)))),
        Term::Timestamp(ms) => Ok(tagged("Date", Value::Number((*ms).into()))),
        Term::Regex { source, flags } => {
            let mut map = JsonMap::new();
            map.insert("source".to_string(), Value::String(source.clone()));
            map.insert("flags".to_string(), Value::String(flags.clone()));
            Ok(tagged("RegExp", Value::Object(map)))
        }
        Term::Error(err) => {
            let mut map = JsonMap::new();
            map.insert("name".to_string(), Value::String(err.name.clone()));
            map.insert("message".to_string(), Value::String(err.message.clone()));
            if let Some(stack) = &err.stack {
                map.insert("stack".to_string(), Value::String(stack.clone()));
            }
            if let Some(cause) = &err.cause {
                map.insert("cause".to_string(), encode_at(cause, depth + 1)?);
            }
            Ok(tagged("Error", Value::Object(map)))
        }
        Term::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_at(item, depth + 1)?);
            }
            Ok(Value::Array(out))
        }
        Term::Set(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_at(item, depth + 1)?);
            }
            Ok(tagged("Set", Value::Array(out)))
        }
        Term::Map(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                out.push(Value::Array(vec![
                    encode_at(k, depth + 1)?,
                    encode_at(v, depth + 1)?,
                ]));
            }
            Ok(tagged("Map", Value::Array(out)))
        }
        Term::Object(map) => {
            if map.contains_key(TYPE_MARKER) {
                return Err(CodecError::ReservedKey);
            }
            let mut out = JsonMap::new();
            for (k, v) in map {
                out.insert(k.clone(), encode_at(v, depth + 1)?);
            }
            Ok(Value::Object(out))
        }
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode a tagged JSON value back into a term.
pub fn decode(value: &Value) -> Result<Term, CodecError> {
    decode_at(value, 0)
}

fn malformed(tag: &str, reason: &str) -> CodecError {
    CodecError::MalformedSpecial {
        tag: tag.to_string(),
        reason: reason.to_string(),
    }
}

fn decode_at(value: &Value, depth: usize) -> Result<Term, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthExceeded(MAX_DEPTH));
    }
    match value {
        Value::Null => Ok(Term::Null),
        Value::Bool(b) => Ok(Term::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Term::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Term::Float(f))
            } else {
                Err(CodecError::NonFiniteNumber)
            }
        }
        Value::String(s) => Ok(Term::Str(s.clone())),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_at(item, depth + 1)?);
            }
            Ok(Term::List(out))
        }
        Value::Object(map) => match map.get(TYPE_MARKER) {
            Some(Value::String(tag)) => decode_special(tag, map.get("value"), depth),
            Some(_) => Err(CodecError::ReservedKey),
            None => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), decode_at(v, depth + 1)?);
                }
                Ok(Term::Object(out))
            }
        },
    }
}

fn decode_special(tag: &str, value: Option<&Value>, depth: usize) -> Result<Term, CodecError> {
    match tag {
        "undefined" => Ok(Term::Undefined),
        "Date" => match value {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Term::Timestamp)
                .ok_or_else(|| malformed("Date", "expected integer milliseconds")),
            _ => Err(malformed("Date", "expected integer milliseconds")),
        },
        "BigInt" => match value {
            Some(Value::String(digits)) => {
                let body = digits.strip_prefix('-').unwrap_or(digits);
                if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit()) {
                    return Err(CodecError::MalformedBigInt(digits.clone()));
                }
                Ok(Term::BigInt(digits.clone()))
            }
            _ => Err(malformed("BigInt", "expected a decimal string")),
        },
        "Bytes" => match value {
            Some(Value::String(b64)) => BASE64
                .decode(b64)
                .map(Term::Bytes)
                .map_err(|_| malformed("Bytes", "invalid base64")),
            _ => Err(malformed("Bytes", "expected a base64 string")),
        },
        "Set" => match value {
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(decode_at(item, depth + 1)?);
                }
                Ok(Term::Set(out))
            }
            _ => Err(malformed("Set", "expected an array")),
        },
        "Map" => match value {
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Array(pair) if pair.len() == 2 => {
                            out.push((
                                decode_at(&pair[0], depth + 1)?,
                                decode_at(&pair[1], depth + 1)?,
                            ));
                        }
                        _ => return Err(malformed("Map", "expected [key, value] pairs")),
                    }
                }
                Ok(Term::Map(out))
            }
            _ => Err(malformed("Map", "expected an array of pairs")),
        },
        "RegExp" => match value {
            Some(Value::Object(obj)) => {
                let source = obj
                    .get("source")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("RegExp", "missing source"))?;
                let flags = obj.get("flags").and_then(Value::as_str).unwrap_or("");
                Ok(Term::Regex {
                    source: source.to_string(),
                    flags: flags.to_string(),
                })
            }
            _ => Err(malformed("RegExp", "expected an object")),
        },
        "Error" => match value {
            Some(Value::Object(obj)) => {
                let name = obj
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("Error", "missing name"))?;
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("Error", "missing message"))?;
                let stack = obj.get("stack").and_then(Value::as_str).map(String::from);
                let cause = match obj.get("cause") {
                    Some(v) => Some(decode_at(v, depth + 1)?),
                    None => None,
                };
                Ok(Term::Error(Box::new(ErrorTerm {
                    name: name.to_string(),
                    message: message.to_string(),
                    stack,
                    cause,
                })))
            }
            _ => Err(malformed("Error", "expected an object")),
        },
        other => Err(CodecError::UnknownTag(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Serde integration
// ---------------------------------------------------------------------------

impl Serialize for Term {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encode(self)
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Term {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        decode(&value).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(term: Term) {
        let encoded = encode(&term).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, term, "roundtrip mismatch for {:?}", term);
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(Term::Null);
        roundtrip(Term::Bool(true));
        roundtrip(Term::Bool(false));
        roundtrip(Term::Int(0));
        roundtrip(Term::Int(i64::MIN));
        roundtrip(Term::Int(i64::MAX));
        roundtrip(Term::Float(1.5));
        roundtrip(Term::Str("hello".into()));
        roundtrip(Term::Str("".into()));
    }

    #[test]
    fn test_undefined_roundtrip() {
        let encoded = encode(&Term::Undefined).unwrap();
        assert_eq!(encoded[TYPE_MARKER], "undefined");
        assert_eq!(decode(&encoded).unwrap(), Term::Undefined);
    }

    #[test]
    fn test_special_roundtrips() {
        roundtrip(Term::Timestamp(1_700_000_000_000));
        roundtrip(Term::BigInt("123456789012345678901234567890".into()));
        roundtrip(Term::BigInt("-42".into()));
        roundtrip(Term::Bytes(vec![0, 1, 2, 255]));
        roundtrip(Term::Bytes(vec![]));
        roundtrip(Term::Regex {
            source: "^a.c$".into(),
            flags: "i".into(),
        });
    }

    #[test]
    fn test_error_roundtrip() {
        let mut err = ErrorTerm::new("TypeError", "boom");
        err.stack = Some("at main".into());
        err.cause = Some(Term::error("IoError", "disk"));
        roundtrip(Term::Error(Box::new(err)));
    }

    #[test]
    fn test_container_roundtrips() {
        roundtrip(Term::List(vec![Term::Int(1), Term::Str("x".into())]));
        roundtrip(Term::Set(vec![Term::Int(1), Term::Int(2)]));
        roundtrip(Term::Map(vec![
            (Term::Int(1), Term::Str("one".into())),
            (Term::Str("k".into()), Term::Bool(true)),
        ]));
        roundtrip(Term::object([
            ("a", Term::Int(1)),
            ("b", Term::List(vec![Term::Null])),
        ]));
    }

    #[test]
    fn test_nested_special_in_object() {
        roundtrip(Term::object([
            ("when", Term::Timestamp(12345)),
            ("blob", Term::Bytes(vec![9, 9])),
            ("tags", Term::Set(vec![Term::Str("a".into())])),
        ]));
    }

    #[test]
    fn test_reserved_key_rejected() {
        let mut map = BTreeMap::new();
        map.insert(TYPE_MARKER.to_string(), Term::Int(1));
        assert_eq!(encode(&Term::Object(map)), Err(CodecError::ReservedKey));
    }

    #[test]
    fn test_malformed_bigint_rejected() {
        assert!(matches!(
            encode(&Term::BigInt("12a".into())),
            Err(CodecError::MalformedBigInt(_))
        ));
        assert!(matches!(
            encode(&Term::BigInt("".into())),
            Err(CodecError::MalformedBigInt(_))
        ));
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert_eq!(
            encode(&Term::Float(f64::NAN)),
            Err(CodecError::NonFiniteNumber)
        );
        assert_eq!(
            encode(&Term::Float(f64::INFINITY)),
            Err(CodecError::NonFiniteNumber)
        );
    }

    #[test]
    fn test_depth_cap() {
        let mut term = Term::Int(0);
        for _ in 0..200 {
            term = Term::List(vec![term]);
        }
        assert!(matches!(encode(&term), Err(CodecError::DepthExceeded(_))));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let value = serde_json::json!({ TYPE_MARKER: "Widget", "value": 1 });
        assert!(matches!(
            decode(&value),
            Err(CodecError::UnknownTag(tag)) if tag == "Widget"
        ));
    }

    #[test]
    fn test_malformed_special_payloads() {
        let value = serde_json::json!({ TYPE_MARKER: "Date", "value": "yesterday" });
        assert!(decode(&value).is_err());
        let value = serde_json::json!({ TYPE_MARKER: "Bytes", "value": "!!!" });
        assert!(decode(&value).is_err());
        let value = serde_json::json!({ TYPE_MARKER: "Map", "value": [[1]] });
        assert!(decode(&value).is_err());
    }

    #[test]
    fn test_serde_through_json_string() {
        let term = Term::object([
            ("n", Term::Int(7)),
            ("at", Term::Timestamp(99)),
        ]);
        let json = serde_json::to_string(&term).unwrap();
        let back: Term = serde_json::from_str(&json).unwrap();
        assert_eq!(back, term);
    }

    #[test]
    fn test_object_key_order_is_canonical() {
        // Object keys are sorted, so two structurally equal terms serialize
        // to identical bytes. Signing depends on this.
        let a = Term::object([("b", Term::Int(2)), ("a", Term::Int(1))]);
        let b = Term::object([("a", Term::Int(1)), ("b", Term::Int(2))]);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_accessors() {
        let term = Term::object([("k", Term::Int(3))]);
        assert_eq!(term.get("k").and_then(Term::as_i64), Some(3));
        assert!(term.get("missing").is_none());
        assert_eq!(Term::Bool(true).as_bool(), Some(true));
        assert_eq!(Term::str("s").as_str(), Some("s"));
    }
}
