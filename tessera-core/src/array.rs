//! Array operations on structured container values.

use serde_json::Value;
use std::ops::Range;

use crate::StorageConfig;

/// Clamp a caller-supplied PUSH length into `0..=push_max_length_limit`.
pub fn resolve_push_max_length(requested: Option<i64>, config: &StorageConfig) -> usize {
    match requested {
        None => config.push_default_max_length,
        Some(n) if n <= 0 => 0,
        Some(n) => usize::try_from(n)
            .unwrap_or(usize::MAX)
            .min(config.push_max_length_limit),
    }
}

/// Append `value` and evict the oldest elements beyond `max_len`.
/// Returns the new length.
pub fn push_bounded(array: &mut Vec<Value>, value: Value, max_len: usize) -> usize {
    array.push(value);
    if array.len() > max_len {
        let excess = array.len() - max_len;
        array.drain(..excess);
    }
    array.len()
}

/// Resolve Python-style `[start:end]` bounds against a length.
///
/// Negative indices count from the end; out-of-range indices are clamped;
/// `start >= end` yields an empty range.
pub fn slice_bounds(len: usize, start: Option<i64>, end: Option<i64>) -> Range<usize> {
    let len_i = len as i64;
    let clamp = |idx: i64| -> usize {
        let resolved = if idx < 0 { idx + len_i } else { idx };
        resolved.clamp(0, len_i) as usize
    };
    let lo = start.map(clamp).unwrap_or(0);
    let hi = end.map(clamp).unwrap_or(len);
    if lo >= hi {
        lo..lo
    } else {
        lo..hi
    }
}

/// Copy of `values[start:end]` with Python semantics.
pub fn slice(values: &[Value], start: Option<i64>, end: Option<i64>) -> Vec<Value> {
    values[slice_bounds(values.len(), start, end)].to_vec()
}
