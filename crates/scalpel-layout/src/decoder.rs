//! Structure decoder: interprets a [`StructSpec`] against a byte source
//!
//! Decoding is purely functional. Every read is bounds-checked against the
//! source before interpretation, so corrupt input yields
//! [`DecodeError::Truncated`] instead of garbage or a panic.

use crate::member::{ByteOrder, Condition, Expr, Member};
use crate::spec::StructSpec;
use scalpel_core::security::{
    checked_add_u64, validate_allocation_size, validate_element_count, MAX_ALLOCATION_SIZE,
    MAX_ARRAY_ELEMENTS, MAX_LAYOUT_NESTING,
};
use scalpel_core::{ByteReader, DecodeError, Value, ValueTree};
use std::cell::Cell;

/// Decode `spec` from `source` starting at absolute `offset`
///
/// The same `(spec, bytes, offset)` always yields the same tree, and no
/// byte outside `[offset, offset + tree.size)` is read.
pub fn decode<R: ByteReader + ?Sized>(
    spec: &StructSpec,
    source: &R,
    offset: u64,
) -> Result<ValueTree, DecodeError> {
    let decoder = Decoder {
        source,
        elements: Cell::new(0),
    };
    decoder.decode_struct(spec, offset, ByteOrder::Native, None, 0)
}

/// Chain of partially decoded structures, innermost first
struct Scope<'a> {
    tree: &'a ValueTree,
    parent: Option<&'a Scope<'a>>,
}

impl Scope<'_> {
    fn resolve(&self, name: &str) -> Option<&Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(value) = current.tree.get(name) {
                return Some(value);
            }
            scope = current.parent;
        }
        None
    }

    fn eval(&self, expr: &Expr) -> Result<u64, DecodeError> {
        match expr {
            Expr::Const(v) => Ok(*v),
            Expr::Field(name) => {
                let value = self.resolve(name).ok_or_else(|| {
                    DecodeError::invalid_expression(format!("unknown field '{}'", name))
                })?;
                value.as_u64().ok_or_else(|| {
                    DecodeError::invalid_expression(format!(
                        "field '{}' is not a non-negative integer",
                        name
                    ))
                })
            }
            Expr::Add(a, b) => self
                .eval(a)?
                .checked_add(self.eval(b)?)
                .ok_or_else(|| DecodeError::invalid_expression("addition overflow")),
            Expr::Sub(a, b) => self
                .eval(a)?
                .checked_sub(self.eval(b)?)
                .ok_or_else(|| DecodeError::invalid_expression("subtraction underflow")),
            Expr::Mul(a, b) => self
                .eval(a)?
                .checked_mul(self.eval(b)?)
                .ok_or_else(|| DecodeError::invalid_expression("multiplication overflow")),
            Expr::Div(a, b) => self
                .eval(a)?
                .checked_div(self.eval(b)?)
                .ok_or_else(|| DecodeError::invalid_expression("division by zero")),
        }
    }

    fn holds(&self, condition: &Condition) -> Result<bool, DecodeError> {
        Ok(match condition {
            Condition::Always => true,
            Condition::Eq(a, b) => self.eval(a)? == self.eval(b)?,
            Condition::Ne(a, b) => self.eval(a)? != self.eval(b)?,
            Condition::Lt(a, b) => self.eval(a)? < self.eval(b)?,
            Condition::Gt(a, b) => self.eval(a)? > self.eval(b)?,
            Condition::And(a, b) => self.holds(a)? && self.holds(b)?,
            Condition::Or(a, b) => self.holds(a)? || self.holds(b)?,
            Condition::Not(c) => !self.holds(c)?,
        })
    }
}

struct Decoder<'s, R: ?Sized> {
    source: &'s R,
    /// Array elements decoded so far, across every array in the layout
    elements: Cell<u64>,
}

impl<R: ByteReader + ?Sized> Decoder<'_, R> {
    /// Fail with `Truncated` unless `[offset, offset + length)` is readable
    fn require(&self, offset: u64, length: u64) -> Result<(), DecodeError> {
        let available = self.source.len();
        match offset.checked_add(length) {
            Some(end) if end <= available => Ok(()),
            _ => Err(DecodeError::Truncated {
                offset,
                needed: length,
                available: available.saturating_sub(offset),
            }),
        }
    }

    /// Charge one array element against the decode-wide budget
    ///
    /// Zero-sized elements pass every bounds check, so nested arrays of
    /// them are only stopped here.
    fn count_element(&self, name: &str) -> Result<(), DecodeError> {
        let decoded = self.elements.get() + 1;
        if decoded > MAX_ARRAY_ELEMENTS {
            return Err(DecodeError::limit_exceeded(format!(
                "array '{}' exceeds the limit of {} elements per decode",
                name, MAX_ARRAY_ELEMENTS
            )));
        }
        self.elements.set(decoded);
        Ok(())
    }

    fn decode_struct(
        &self,
        spec: &StructSpec,
        offset: u64,
        inherited: ByteOrder,
        parent: Option<&Scope<'_>>,
        depth: usize,
    ) -> Result<ValueTree, DecodeError> {
        if depth > MAX_LAYOUT_NESTING {
            return Err(DecodeError::limit_exceeded(format!(
                "layout '{}' nests deeper than {}",
                spec.name(),
                MAX_LAYOUT_NESTING
            )));
        }

        let order = spec.byte_order().unwrap_or(inherited);

        // A fixed-size structure must fit entirely before anything is decoded.
        if let Some(size) = spec.static_size() {
            self.require(offset, size)?;
        }

        let mut tree = ValueTree::new(offset);
        let mut cursor = offset;

        for field in spec.fields() {
            if let Some(at) = field.at {
                let target = checked_add_u64(offset, at, &field.name)?;
                if target < cursor {
                    return Err(DecodeError::invalid_layout(format!(
                        "field '{}' at +{} overlaps the preceding member in '{}'",
                        field.name,
                        at,
                        spec.name()
                    )));
                }
                cursor = target;
            }

            let scope = Scope {
                tree: &tree,
                parent,
            };
            let (value, end) = self.decode_member(&field.member, &field.name, cursor, order, &scope, depth)?;
            tree.push(field.name.clone(), value);
            cursor = end;
        }

        let consumed = cursor - offset;
        let size = match spec.declared_size() {
            Some(declared) if declared > consumed => {
                self.require(offset, declared)?;
                declared
            }
            _ => consumed,
        };
        tree.size = size;
        Ok(tree)
    }

    /// Decode one member at `cursor`; returns the value and the offset after it
    fn decode_member(
        &self,
        member: &Member,
        name: &str,
        cursor: u64,
        order: ByteOrder,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<(Value, u64), DecodeError> {
        match member {
            Member::Scalar { ty, order: own } => {
                let width = ty.size();
                self.require(cursor, width)?;
                let raw = self.source.read_at(cursor, width)?;
                let value = ty.interpret(&raw, own.unwrap_or(order)).ok_or_else(|| {
                    DecodeError::invalid_layout(format!("short scalar read for '{}'", name))
                })?;
                Ok((value, cursor + width))
            }

            Member::Bytes(length) => {
                let length = scope.eval(length)?;
                validate_allocation_size(length, MAX_ALLOCATION_SIZE, name)?;
                self.require(cursor, length)?;
                let raw = self.source.read_at(cursor, length)?;
                Ok((Value::Bytes(raw.to_vec()), cursor + length))
            }

            Member::Array { element, count } => {
                let count = validate_element_count(scope.eval(count)?, name)?;
                if let Some(stride) = element.static_size() {
                    let total = stride.checked_mul(count).ok_or_else(|| {
                        DecodeError::invalid_expression(format!("array '{}' size overflow", name))
                    })?;
                    self.require(cursor, total)?;
                }

                let mut items = Vec::with_capacity(count.min(1024) as usize);
                let mut position = cursor;
                for _ in 0..count {
                    self.count_element(name)?;
                    let item = self.decode_struct(element, position, order, Some(scope), depth + 1)?;
                    position = item.end();
                    items.push(item);
                }
                Ok((Value::Array(items), position))
            }

            Member::Struct(spec) => {
                let tree = self.decode_struct(spec, cursor, order, Some(scope), depth + 1)?;
                let end = tree.end();
                Ok((Value::Struct(tree), end))
            }

            Member::Union { variants, size } => {
                let fixed = match size {
                    Some(size) => {
                        let size = scope.eval(size)?;
                        self.require(cursor, size)?;
                        Some(size)
                    }
                    None => None,
                };

                for variant in variants {
                    if !scope.holds(&variant.when)? {
                        continue;
                    }
                    let tree = self.decode_struct(&variant.layout, cursor, order, Some(scope), depth + 1)?;
                    let end = match fixed {
                        Some(size) => cursor + size.max(tree.size),
                        None => tree.end(),
                    };
                    let value = Value::Variant {
                        name: variant.name.clone(),
                        tree,
                    };
                    return Ok((value, end));
                }

                Err(DecodeError::NoMatchingVariant {
                    member: name.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Variant;
    use bytes::Bytes;
    use scalpel_core::BoundsError;
    use std::sync::Mutex;

    /// Records every range read so tests can check decode stays in bounds
    struct Recorder {
        data: Vec<u8>,
        reads: Mutex<Vec<(u64, u64)>>,
    }

    impl Recorder {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                reads: Mutex::new(Vec::new()),
            }
        }
    }

    impl ByteReader for Recorder {
        fn len(&self) -> u64 {
            self.data.len() as u64
        }

        fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
            self.reads.lock().unwrap().push((offset, length));
            self.data.read_at(offset, length)
        }
    }

    fn header_with_records() -> StructSpec {
        let element = StructSpec::little("element")
            .field("id", Member::u64())
            .field("value", Member::u64());
        StructSpec::little("header")
            .field("magic", Member::u32())
            .field("count", Member::u32())
            .field("elements", Member::array(element, "count"))
    }

    fn sample_image() -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        data[4..8].copy_from_slice(&3u32.to_le_bytes());
        for i in 0..3u64 {
            let at = 8 + (i as usize) * 16;
            data[at..at + 8].copy_from_slice(&(i + 1).to_le_bytes());
            data[at + 8..at + 16].copy_from_slice(&(100 * (i + 1)).to_le_bytes());
        }
        data
    }

    #[test]
    fn test_decode_counted_array() {
        let data = sample_image();
        let tree = decode(&header_with_records(), &data, 0).unwrap();

        assert_eq!(tree.get_u64("magic"), Some(0xDEADBEEF));
        assert_eq!(tree.get_u64("count"), Some(3));

        let elements = tree.get("elements").and_then(Value::as_array).unwrap();
        assert_eq!(elements.len(), 3);
        let offsets: Vec<u64> = elements.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![8, 24, 40]);
        assert!(elements.iter().all(|e| e.size == 16));
        assert_eq!(elements[2].get_u64("value"), Some(300));
        assert_eq!(tree.size, 56);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let data = sample_image();
        let spec = header_with_records();
        let first = decode(&spec, &data, 0).unwrap();
        let second = decode(&spec, &data, 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_reads_stay_in_range() {
        let mut data = vec![0xFFu8; 64];
        data.extend_from_slice(&sample_image());
        let source = Recorder::new(data);

        let tree = decode(&header_with_records(), &source, 64).unwrap();
        let reads = source.reads.lock().unwrap();
        assert!(!reads.is_empty());
        for &(offset, length) in reads.iter() {
            assert!(offset >= 64);
            assert!(offset + length <= tree.end());
        }
    }

    #[test]
    fn test_decode_truncated_scalar() {
        let spec = StructSpec::little("s").field("a", Member::u32());
        let err = decode(&spec, &vec![1u8, 2], 0).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 0,
                needed: 4,
                available: 2
            }
        );
    }

    #[test]
    fn test_decode_truncated_array_fails_before_reading_elements() {
        let mut data = sample_image();
        data[4..8].copy_from_slice(&1000u32.to_le_bytes());
        let source = Recorder::new(data);

        let err = decode(&header_with_records(), &source, 0).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { offset: 8, .. }));
        assert_eq!(source.reads.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_decode_offset_past_end() {
        let spec = StructSpec::little("s").field("a", Member::u8());
        let err = decode(&spec, &vec![0u8; 4], u64::MAX).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_decode_variable_length_bytes() {
        let spec = StructSpec::big("tlv")
            .field("tag", Member::u8())
            .field("length", Member::u16())
            .field("value", Member::bytes(Expr::field("length").minus(1u64)));
        let data = vec![0x07, 0x00, 0x04, b'a', b'b', b'c', 0xEE];
        let tree = decode(&spec, &data, 0).unwrap();
        assert_eq!(tree.get_bytes("value"), Some(&b"abc"[..]));
        assert_eq!(tree.size, 6);
    }

    #[test]
    fn test_decode_byte_order_override() {
        let spec = StructSpec::little("mixed")
            .field("le", Member::u16())
            .field("be", Member::scalar_in(crate::ScalarType::U16, ByteOrder::Network));
        let data = vec![0x01, 0x02, 0x01, 0x02];
        let tree = decode(&spec, &data, 0).unwrap();
        assert_eq!(tree.get_u64("le"), Some(0x0201));
        assert_eq!(tree.get_u64("be"), Some(0x0102));
    }

    #[test]
    fn test_nested_spec_inherits_order() {
        let inner = StructSpec::new("inner").field("v", Member::u16());
        let spec = StructSpec::big("outer").field("inner", Member::structure(inner));
        let tree = decode(&spec, &vec![0x12, 0x34], 0).unwrap();
        assert_eq!(tree.lookup("inner.v").and_then(Value::as_u64), Some(0x1234));
    }

    fn tagged_union() -> StructSpec {
        let small = StructSpec::little("small").field("v", Member::u8());
        let wide = StructSpec::little("wide").field("v", Member::u32());
        StructSpec::little("tagged")
            .field("kind", Member::u8())
            .field(
                "body",
                Member::union(vec![
                    Variant::new("small", Condition::equals("kind", 1u64), small),
                    Variant::new("wide", Condition::equals("kind", 2u64), wide),
                ]),
            )
            .field("trailer", Member::u8())
    }

    #[test]
    fn test_union_commits_to_first_matching_variant() {
        let tree = decode(&tagged_union(), &vec![2, 0x78, 0x56, 0x34, 0x12, 0xAA], 0).unwrap();
        match tree.get("body").unwrap() {
            Value::Variant { name, tree } => {
                assert_eq!(name, "wide");
                assert_eq!(tree.offset, 1);
                assert_eq!(tree.get_u64("v"), Some(0x12345678));
            }
            other => panic!("expected variant, got {:?}", other),
        }
        assert_eq!(tree.get_u64("trailer"), Some(0xAA));

        let tree = decode(&tagged_union(), &vec![1, 0x42, 0xBB], 0).unwrap();
        assert_eq!(tree.lookup("body.v").and_then(Value::as_u64), Some(0x42));
        assert_eq!(tree.get_u64("trailer"), Some(0xBB));
    }

    #[test]
    fn test_union_without_match() {
        let err = decode(&tagged_union(), &vec![9, 0, 0, 0, 0, 0], 0).unwrap_err();
        assert_eq!(
            err,
            DecodeError::NoMatchingVariant {
                member: "body".to_string()
            }
        );
    }

    #[test]
    fn test_union_fixed_size() {
        let a = StructSpec::little("a").field("v", Member::u8());
        let spec = StructSpec::little("u")
            .field("body", Member::union_sized(vec![Variant::new("a", Condition::Always, a)], 4u64))
            .field("after", Member::u8());
        let tree = decode(&spec, &vec![1, 2, 3, 4, 5], 0).unwrap();
        assert_eq!(tree.get_u64("after"), Some(5));
    }

    #[test]
    fn test_array_element_sees_enclosing_fields() {
        let entry = StructSpec::little("entry")
            .field("id", Member::u8())
            .field("pad", Member::bytes(Expr::field("stride").minus(1u64)));
        let spec = StructSpec::little("table")
            .field("stride", Member::u8())
            .field("count", Member::u8())
            .field("entries", Member::array(entry, "count"));
        let data = vec![3, 2, 0xA, 0, 0, 0xB, 0, 0];
        let tree = decode(&spec, &data, 0).unwrap();
        let entries = tree.get("entries").and_then(Value::as_array).unwrap();
        assert_eq!(entries[1].offset, 5);
        assert_eq!(entries[1].get_u64("id"), Some(0xB));
    }

    #[test]
    fn test_unknown_field_is_invalid_expression() {
        let spec = StructSpec::little("s").field("data", Member::bytes("missing"));
        let err = decode(&spec, &vec![0u8; 8], 0).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidExpression(_)));
    }

    #[test]
    fn test_non_integer_field_is_invalid_expression() {
        let spec = StructSpec::little("s")
            .field("blob", Member::bytes(2u64))
            .field("data", Member::bytes("blob"));
        let err = decode(&spec, &vec![0u8; 8], 0).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidExpression(_)));
    }

    #[test]
    fn test_division_by_zero() {
        let spec = StructSpec::little("s")
            .field("n", Member::u8())
            .field("data", Member::bytes(Expr::Const(8).divided_by("n")));
        let err = decode(&spec, &vec![0u8; 8], 0).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidExpression(_)));
    }

    #[test]
    fn test_backwards_offset_is_invalid_layout() {
        let spec = StructSpec::little("s")
            .field("a", Member::u64())
            .field_at("b", 4, Member::u32());
        let err = decode(&spec, &vec![0u8; 16], 0).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidLayout(_)));
    }

    #[test]
    fn test_explicit_offset_skips_gap() {
        let spec = StructSpec::little("s")
            .field("a", Member::u8())
            .field_at("b", 6, Member::u16());
        let tree = decode(&spec, &vec![1, 0, 0, 0, 0, 0, 0x34, 0x12], 0).unwrap();
        assert_eq!(tree.get_u64("b"), Some(0x1234));
        assert_eq!(tree.size, 8);
    }

    #[test]
    fn test_huge_count_is_limited() {
        let element = StructSpec::little("e");
        let spec = StructSpec::little("s")
            .field("count", Member::u32())
            .field("items", Member::array(element, "count"));
        let err = decode(&spec, &vec![0xFF, 0xFF, 0xFF, 0xFF], 0).unwrap_err();
        assert!(matches!(err, DecodeError::LimitExceeded(_)));
    }

    #[test]
    fn test_nested_empty_elements_are_limited() {
        let cell = StructSpec::little("cell");
        let row = StructSpec::little("row").field("cells", Member::array(cell, 1_000u64));
        let spec = StructSpec::little("grid").field("rows", Member::array(row, 1_001u64));

        let err = decode(&spec, &vec![0u8; 4], 0).unwrap_err();
        assert!(matches!(err, DecodeError::LimitExceeded(msg) if msg.contains("cells")));
    }

    #[test]
    fn test_union_without_match_inside_array() {
        let spec = StructSpec::little("list").field("items", Member::array(tagged_union(), 2u64));
        let data = vec![1, 0x42, 0xBB, 9, 0, 0, 0, 0, 0];
        assert_eq!(
            decode(&spec, &data, 0).unwrap_err(),
            DecodeError::NoMatchingVariant {
                member: "body".to_string()
            }
        );

        let data = vec![1, 0x42, 0xBB, 2, 0x78, 0x56, 0x34, 0x12, 0xAA];
        let tree = decode(&spec, &data, 0).unwrap();
        let items = tree.get("items").and_then(Value::as_array).unwrap();
        assert_eq!(items[1].lookup("body.v").and_then(Value::as_u64), Some(0x12345678));
        assert_eq!(tree.size, 9);
    }

    #[test]
    fn test_declared_size_must_be_present() {
        let spec = StructSpec::little("s").field("a", Member::u8()).sized(8);
        assert!(decode(&spec, &vec![0u8; 8], 0).is_ok());
        assert!(matches!(
            decode(&spec, &vec![0u8; 4], 0),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
