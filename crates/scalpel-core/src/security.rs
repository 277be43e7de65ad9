//! Safety limits and checked arithmetic for adversarial input
//!
//! Forensic input is frequently corrupt or hostile. These limits keep a
//! single malformed length field from exhausting memory or looping forever.

use crate::error::DecodeError;

/// Maximum size of a single read or byte-array member (256 MB)
pub const MAX_ALLOCATION_SIZE: u64 = 256 * 1024 * 1024;

/// Maximum element count of a single array member
pub const MAX_ARRAY_ELEMENTS: u64 = 1_000_000;

/// Maximum nesting depth of layouts (struct within array within union ...)
pub const MAX_LAYOUT_NESTING: usize = 64;

/// Maximum file size for memory mapping (16 GB)
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Maximum partition count (128 for GPT, padded for safety)
pub const MAX_PARTITION_COUNT: u64 = 256;

/// Validate that a size is within allocation limits
pub fn validate_allocation_size(size: u64, limit: u64, context: &str) -> Result<usize, DecodeError> {
    if size > limit {
        return Err(DecodeError::limit_exceeded(format!(
            "{} size {} exceeds limit {}",
            context, size, limit
        )));
    }

    size.try_into().map_err(|_| {
        DecodeError::limit_exceeded(format!("{} size exceeds platform limits", context))
    })
}

/// Validate an element count against [`MAX_ARRAY_ELEMENTS`]
pub fn validate_element_count(count: u64, context: &str) -> Result<u64, DecodeError> {
    if count > MAX_ARRAY_ELEMENTS {
        return Err(DecodeError::limit_exceeded(format!(
            "{} count {} exceeds limit {}",
            context, count, MAX_ARRAY_ELEMENTS
        )));
    }
    Ok(count)
}

/// Safely multiply two u64 values with overflow checking
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> Result<u64, DecodeError> {
    a.checked_mul(b)
        .ok_or_else(|| DecodeError::invalid_expression(format!("{}: multiplication overflow", context)))
}

/// Safely add two u64 values with overflow checking
pub fn checked_add_u64(a: u64, b: u64, context: &str) -> Result<u64, DecodeError> {
    a.checked_add(b)
        .ok_or_else(|| DecodeError::invalid_expression(format!("{}: addition overflow", context)))
}
