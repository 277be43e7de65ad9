//! # Scalpel Layout
//!
//! Declarative binary layouts and the structure decoder.
//!
//! A [`StructSpec`] is pure data: an ordered list of named [`Member`]s with a
//! byte order. [`decode`] interprets it against any [`ByteReader`] at an
//! offset and produces a [`ValueTree`]. Lengths and counts may be
//! [`Expr`]essions over previously decoded fields, and unions pick an
//! alternative by evaluating a [`Condition`] over those fields.
//!
//! ## Example
//!
//! ```rust
//! use scalpel_layout::{decode, Member, StructSpec};
//!
//! let entry = StructSpec::little("entry").field("lba", Member::u32());
//! let table = StructSpec::little("table")
//!     .field("count", Member::u8())
//!     .field("entries", Member::array(entry, "count"));
//!
//! let data = vec![2, 1, 0, 0, 0, 2, 0, 0, 0];
//! let tree = decode(&table, &data, 0).unwrap();
//! assert_eq!(tree.size, 9);
//! ```
//!
//! [`ByteReader`]: scalpel_core::ByteReader
//! [`ValueTree`]: scalpel_core::ValueTree

pub mod decoder;
pub mod member;
pub mod spec;

pub use decoder::decode;
pub use member::{ByteOrder, Condition, Expr, Field, Member, ScalarType, Variant};
pub use spec::StructSpec;
