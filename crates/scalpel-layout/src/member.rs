//! Layout members: scalars, byte arrays, arrays, unions and expressions

use crate::spec::StructSpec;
use scalpel_core::Value;

/// Byte order of multi-byte scalars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Host byte order
    #[default]
    Native,
    Little,
    Big,
    /// Network byte order (big-endian)
    Network,
}

impl ByteOrder {
    /// Whether this order reads the least significant byte first
    pub fn is_little(self) -> bool {
        match self {
            ByteOrder::Native => cfg!(target_endian = "little"),
            ByteOrder::Little => true,
            ByteOrder::Big | ByteOrder::Network => false,
        }
    }
}

/// Primitive scalar types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ScalarType {
    /// Encoded width in bytes
    pub fn size(self) -> u64 {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        }
    }

    /// Interpret `raw` as this type; `None` if `raw` has the wrong width
    pub fn interpret(self, raw: &[u8], order: ByteOrder) -> Option<Value> {
        macro_rules! read {
            ($t:ty) => {{
                let bytes = raw.try_into().ok()?;
                if order.is_little() {
                    <$t>::from_le_bytes(bytes)
                } else {
                    <$t>::from_be_bytes(bytes)
                }
            }};
        }

        let value = match self {
            ScalarType::U8 => Value::Unsigned(read!(u8) as u64),
            ScalarType::U16 => Value::Unsigned(read!(u16) as u64),
            ScalarType::U32 => Value::Unsigned(read!(u32) as u64),
            ScalarType::U64 => Value::Unsigned(read!(u64)),
            ScalarType::I8 => Value::Signed(read!(i8) as i64),
            ScalarType::I16 => Value::Signed(read!(i16) as i64),
            ScalarType::I32 => Value::Signed(read!(i32) as i64),
            ScalarType::I64 => Value::Signed(read!(i64)),
            ScalarType::F32 => Value::Float(read!(f32) as f64),
            ScalarType::F64 => Value::Float(read!(f64)),
        };
        Some(value)
    }
}

/// A length or count computed from previously decoded fields
///
/// Expressions are pure functions of the partial value tree, so decoding
/// stays deterministic and always terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(u64),
    /// Value of an already-decoded integer field, innermost scope first
    Field(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn plus(self, rhs: impl Into<Expr>) -> Self {
        Expr::Add(Box::new(self), Box::new(rhs.into()))
    }

    pub fn minus(self, rhs: impl Into<Expr>) -> Self {
        Expr::Sub(Box::new(self), Box::new(rhs.into()))
    }

    pub fn times(self, rhs: impl Into<Expr>) -> Self {
        Expr::Mul(Box::new(self), Box::new(rhs.into()))
    }

    pub fn divided_by(self, rhs: impl Into<Expr>) -> Self {
        Expr::Div(Box::new(self), Box::new(rhs.into()))
    }

    /// Value of the expression when it references no fields
    pub fn constant(&self) -> Option<u64> {
        match self {
            Expr::Const(v) => Some(*v),
            Expr::Field(_) => None,
            Expr::Add(a, b) => a.constant()?.checked_add(b.constant()?),
            Expr::Sub(a, b) => a.constant()?.checked_sub(b.constant()?),
            Expr::Mul(a, b) => a.constant()?.checked_mul(b.constant()?),
            Expr::Div(a, b) => a.constant()?.checked_div(b.constant()?),
        }
    }
}

impl From<u64> for Expr {
    fn from(v: u64) -> Self {
        Expr::Const(v)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::field(name)
    }
}

/// Discriminant predicate selecting a union alternative
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    Eq(Expr, Expr),
    Ne(Expr, Expr),
    Lt(Expr, Expr),
    Gt(Expr, Expr),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn equals(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Condition::Eq(a.into(), b.into())
    }

    pub fn not_equals(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Condition::Ne(a.into(), b.into())
    }

    pub fn less_than(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Condition::Lt(a.into(), b.into())
    }

    pub fn greater_than(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Condition::Gt(a.into(), b.into())
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }
}

/// One alternative of a union
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub name: String,
    pub when: Condition,
    pub layout: StructSpec,
}

impl Variant {
    pub fn new(name: impl Into<String>, when: Condition, layout: StructSpec) -> Self {
        Self {
            name: name.into(),
            when,
            layout,
        }
    }
}

/// How one named field is decoded
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    /// Fixed-width scalar; `order` overrides the structure's byte order
    Scalar {
        ty: ScalarType,
        order: Option<ByteOrder>,
    },
    /// Opaque bytes of computed length
    Bytes(Expr),
    /// `count` consecutive elements of `element`
    Array { element: StructSpec, count: Expr },
    /// Nested sub-structure
    Struct(StructSpec),
    /// Tagged alternatives, all starting at the same offset; the first whose
    /// condition holds is decoded. `size`, when set, is the width consumed
    /// regardless of the alternative chosen.
    Union {
        variants: Vec<Variant>,
        size: Option<Expr>,
    },
}

impl Member {
    pub fn scalar(ty: ScalarType) -> Self {
        Member::Scalar { ty, order: None }
    }

    /// Scalar with an explicit byte order
    pub fn scalar_in(ty: ScalarType, order: ByteOrder) -> Self {
        Member::Scalar {
            ty,
            order: Some(order),
        }
    }

    pub fn u8() -> Self {
        Self::scalar(ScalarType::U8)
    }

    pub fn u16() -> Self {
        Self::scalar(ScalarType::U16)
    }

    pub fn u32() -> Self {
        Self::scalar(ScalarType::U32)
    }

    pub fn u64() -> Self {
        Self::scalar(ScalarType::U64)
    }

    pub fn i32() -> Self {
        Self::scalar(ScalarType::I32)
    }

    pub fn bytes(length: impl Into<Expr>) -> Self {
        Member::Bytes(length.into())
    }

    pub fn array(element: StructSpec, count: impl Into<Expr>) -> Self {
        Member::Array {
            element,
            count: count.into(),
        }
    }

    pub fn structure(spec: StructSpec) -> Self {
        Member::Struct(spec)
    }

    pub fn union(variants: Vec<Variant>) -> Self {
        Member::Union {
            variants,
            size: None,
        }
    }

    pub fn union_sized(variants: Vec<Variant>, size: impl Into<Expr>) -> Self {
        Member::Union {
            variants,
            size: Some(size.into()),
        }
    }

    /// Width in bytes when it does not depend on decoded values
    pub fn static_size(&self) -> Option<u64> {
        match self {
            Member::Scalar { ty, .. } => Some(ty.size()),
            Member::Bytes(len) => len.constant(),
            Member::Array { element, count } => element.static_size()?.checked_mul(count.constant()?),
            Member::Struct(spec) => spec.static_size(),
            Member::Union { size, variants } => match size {
                Some(size) => size.constant(),
                None => {
                    let mut sizes = variants.iter().map(|v| v.layout.static_size());
                    let first = sizes.next()??;
                    sizes.all(|s| s == Some(first)).then_some(first)
                }
            },
        }
    }
}

/// A named member, optionally pinned to an offset relative to its structure
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub member: Member,
    pub at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_interpret_orders() {
        let raw = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(
            ScalarType::U32.interpret(&raw, ByteOrder::Little),
            Some(Value::Unsigned(0x78563412))
        );
        assert_eq!(
            ScalarType::U32.interpret(&raw, ByteOrder::Big),
            Some(Value::Unsigned(0x12345678))
        );
        assert_eq!(
            ScalarType::U32.interpret(&raw, ByteOrder::Network),
            ScalarType::U32.interpret(&raw, ByteOrder::Big)
        );
        assert_eq!(ScalarType::U16.interpret(&raw, ByteOrder::Little), None);
    }

    #[test]
    fn test_scalar_signed_and_float() {
        assert_eq!(
            ScalarType::I16.interpret(&[0xFF, 0xFF], ByteOrder::Little),
            Some(Value::Signed(-1))
        );
        assert_eq!(
            ScalarType::F32.interpret(&1.5f32.to_le_bytes(), ByteOrder::Little),
            Some(Value::Float(1.5))
        );
    }

    #[test]
    fn test_expr_constant_folding() {
        assert_eq!(Expr::Const(4).times(4u64).plus(8u64).constant(), Some(24));
        assert_eq!(Expr::field("n").times(4u64).constant(), None);
        assert_eq!(Expr::Const(1).divided_by(0u64).constant(), None);
    }

    #[test]
    fn test_member_static_size() {
        let entry = StructSpec::new("entry").field("a", Member::u32()).field("b", Member::u32());
        assert_eq!(Member::array(entry.clone(), 4u64).static_size(), Some(32));
        assert_eq!(Member::array(entry, "count").static_size(), None);
        assert_eq!(Member::bytes(446u64).static_size(), Some(446));
    }
}
