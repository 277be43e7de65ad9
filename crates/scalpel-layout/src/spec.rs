//! Structure specifications: ordered, named members with a byte order

use crate::decoder;
use crate::member::{ByteOrder, Field, Member};
use scalpel_core::{ByteReader, DecodeError, ValueTree};

/// Ordered sequence of named members describing one binary structure
///
/// # Example
///
/// ```rust
/// use scalpel_layout::{ByteOrder, Member, StructSpec};
///
/// let record = StructSpec::new("record")
///     .order(ByteOrder::Little)
///     .field("tag", Member::u16())
///     .field("length", Member::u16())
///     .field("payload", Member::bytes("length"));
///
/// let data = [0x01, 0x00, 0x02, 0x00, 0xAA, 0xBB];
/// let tree = record.decode(&data[..], 0).unwrap();
/// assert_eq!(tree.get_bytes("payload"), Some(&[0xAA, 0xBB][..]));
/// assert_eq!(tree.size, 6);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StructSpec {
    name: String,
    order: Option<ByteOrder>,
    fields: Vec<Field>,
    size: Option<u64>,
}

impl StructSpec {
    /// Create an empty spec; byte order is inherited from the enclosing
    /// structure, or native at the top level, until [`order`](Self::order) is set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: None,
            fields: Vec::new(),
            size: None,
        }
    }

    /// Little-endian spec
    pub fn little(name: impl Into<String>) -> Self {
        Self::new(name).order(ByteOrder::Little)
    }

    /// Big-endian spec
    pub fn big(name: impl Into<String>) -> Self {
        Self::new(name).order(ByteOrder::Big)
    }

    /// Set the byte order applied to every scalar without its own override
    pub fn order(mut self, order: ByteOrder) -> Self {
        self.order = Some(order);
        self
    }

    /// Append a member immediately after the previous one
    pub fn field(mut self, name: impl Into<String>, member: Member) -> Self {
        self.fields.push(Field {
            name: name.into(),
            member,
            at: None,
        });
        self
    }

    /// Append a member at `offset` bytes from the start of the structure
    ///
    /// Explicit offsets must not move backwards; the gap before them is
    /// skipped without being read.
    pub fn field_at(mut self, name: impl Into<String>, offset: u64, member: Member) -> Self {
        self.fields.push(Field {
            name: name.into(),
            member,
            at: Some(offset),
        });
        self
    }

    /// Declare the total size, covering trailing padding
    pub fn sized(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.order
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.size
    }

    /// Total size when no member depends on decoded values
    pub fn static_size(&self) -> Option<u64> {
        let mut cursor = 0u64;
        for field in &self.fields {
            if let Some(at) = field.at {
                if at < cursor {
                    return None;
                }
                cursor = at;
            }
            cursor = cursor.checked_add(field.member.static_size()?)?;
        }
        Some(self.size.map_or(cursor, |size| size.max(cursor)))
    }

    /// Decode this spec from `source` at `offset`
    pub fn decode<R: ByteReader + ?Sized>(&self, source: &R, offset: u64) -> Result<ValueTree, DecodeError> {
        decoder::decode(self, source, offset)
    }
}
