//! # Scalpel Pipeline
//!
//! Containers: named, bounds-checked views over bytes.
//!
//! A root [`Container`] wraps a byte source (memory or a memory-mapped
//! file). Children are windows or reassembled extents of a parent and never
//! copy its bytes. Every container has a lazily computed SHA-256
//! [`Fingerprint`](scalpel_core::Fingerprint) that depends only on its
//! content, not on where it is nested.

pub mod container;
pub mod mmap;

pub use container::{Container, Extent, MemorySource};
pub use mmap::MmapSource;
