//! Core types: decoded values, fingerprints and persisted records

use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A single decoded member value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Unsigned integer scalar
    Unsigned(u64),
    /// Signed integer scalar
    Signed(i64),
    /// Floating point scalar, stored bit-exact including NaN and infinities
    Float(#[serde(with = "float_repr")] f64),
    /// Raw opaque bytes
    Bytes(Vec<u8>),
    /// Ordered array of nested structures
    Array(Vec<ValueTree>),
    /// Nested sub-structure
    Struct(ValueTree),
    /// The union alternative that matched, by name
    Variant { name: String, tree: ValueTree },
}

impl Value {
    /// Integer view of a scalar (signed values must be non-negative)
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Unsigned(v) => Some(v),
            Value::Signed(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Signed view of an integer scalar
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Unsigned(v) => i64::try_from(v).ok(),
            Value::Signed(v) => Some(v),
            _ => None,
        }
    }

    /// Float view of a scalar
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ValueTree]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Nested tree of a struct or union value
    pub fn as_tree(&self) -> Option<&ValueTree> {
        match self {
            Value::Struct(tree) | Value::Variant { tree, .. } => Some(tree),
            _ => None,
        }
    }
}

/// Serde form of [`Value::Float`]
///
/// Text formats write finite values as numbers and everything else as a
/// `"f64:<hex bits>"` string, since JSON has no NaN or infinity. Binary
/// formats always write the raw IEEE-754 bits.
mod float_repr {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    const PREFIX: &str = "f64:";

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if !serializer.is_human_readable() {
            return serializer.serialize_u64(value.to_bits());
        }
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&format!("{PREFIX}{:016x}", value.to_bits()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(TextVisitor)
        } else {
            deserializer.deserialize_u64(BitsVisitor)
        }
    }

    struct TextVisitor;

    impl<'de> Visitor<'de> for TextVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a number or an \"{PREFIX}<hex bits>\" string")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            v.strip_prefix(PREFIX)
                .and_then(|bits| u64::from_str_radix(bits, 16).ok())
                .map(f64::from_bits)
                .ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }

    struct BitsVisitor;

    impl<'de> Visitor<'de> for BitsVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("IEEE-754 bits as u64")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(f64::from_bits(v))
        }
    }
}

/// Ordered name → value mapping produced by decoding one structure
///
/// Insertion order matches declaration order. `offset` is absolute within
/// the byte source the structure was decoded from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueTree {
    /// Absolute offset of the first byte of the structure
    pub offset: u64,
    /// Number of bytes the structure covers
    pub size: u64,
    fields: Fields,
}

impl ValueTree {
    /// Create an empty tree anchored at `offset`
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            size: 0,
            fields: Fields::default(),
        }
    }

    /// Append a field, replacing any earlier field of the same name in place
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.fields.0.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.0.push((name, value));
        }
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Value::as_u64)
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(Value::as_bytes)
    }

    /// Resolve a dotted path through nested structs and unions, e.g. `header.signature`
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.get(parts.next()?)?;
        for part in parts {
            current = current.as_tree()?.get(part)?;
        }
        Some(current)
    }

    /// Absolute offset one past the last byte
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn len(&self) -> usize {
        self.fields.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.0.is_empty()
    }

    /// Iterate fields in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.0.iter().map(|(n, _)| n.as_str())
    }
}

/// Field list serialized as an order-preserving map
#[derive(Debug, Clone, Default, PartialEq)]
struct Fields(Vec<(String, Value)>);

impl Serialize for Fields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Fields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = Fields;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Fields, A::Error> {
                let mut fields = Vec::with_capacity(access.size_hint().unwrap_or(0).min(4096));
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    fields.push((name, value));
                }
                Ok(Fields(fields))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

/// SHA-256 content fingerprint of a container
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, the persisted form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Terminal status of a dissection node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Fully dissected
    Ok,
    /// Dissected, but some structures were damaged or skipped
    Partial,
    /// No dissector claimed the content, or recursion stopped before it
    Unrecognized,
    /// Every claiming dissector failed
    Failed,
}

impl Outcome {
    /// Whether a record with this outcome may short-circuit a later dissection
    pub fn is_reusable(self) -> bool {
        matches!(self, Outcome::Ok | Outcome::Partial)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Partial => "partial",
            Outcome::Unrecognized => "unrecognized",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why recursion stopped at a node without dissecting it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The fingerprint already appears on the root-to-node path
    CycleDetected,
    /// The configured maximum depth was reached
    DepthExceeded,
    /// The job's node budget ran out
    NodeBudgetExhausted,
    /// The hash database classifies this content and skipping was requested
    KnownContent,
    /// A cached parent referenced a child with no stored record
    NotRecorded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::CycleDetected => "cycle detected",
            StopReason::DepthExceeded => "depth exceeded",
            StopReason::NodeBudgetExhausted => "node budget exhausted",
            StopReason::KnownContent => "known content",
            StopReason::NotRecorded => "not recorded",
        };
        f.write_str(s)
    }
}

/// Known classifications of a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    pub fingerprint: Fingerprint,
    /// Sorted, de-duplicated labels
    pub labels: Vec<String>,
}

impl HashRecord {
    pub fn new<I, S>(fingerprint: Fingerprint, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut record = Self {
            fingerprint,
            labels: Vec::new(),
        };
        record.merge(labels);
        record
    }

    /// Union `labels` into this record; re-merging the same labels is a no-op
    pub fn merge<I, S>(&mut self, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self.labels.sort();
        self.labels.dedup();
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.binary_search_by(|l| l.as_str().cmp(label)).is_ok()
    }
}

/// Persisted summary of one dissected container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DissectionRecord {
    pub fingerprint: Fingerprint,
    /// Container name at the time of dissection
    pub name: String,
    pub length: u64,
    pub outcome: Outcome,
    /// Name of the dissector that produced the record
    pub dissector: Option<String>,
    pub fields: Option<ValueTree>,
    /// Child fingerprints in exposure order
    pub children: Vec<Fingerprint>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub recorded_at: DateTime<Utc>,
    /// Tool and version that wrote the record
    pub provenance: String,
}
