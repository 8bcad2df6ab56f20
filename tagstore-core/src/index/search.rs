//! Bound searches over sorted timestamps
//!
//! Both functions take an ascending slice (duplicates allowed); pass a
//! sub-slice to search a `[start, end)` range.

use crate::Timestamp;

/// Position of the first element strictly greater than `value`, or `times.len()`
pub fn upper_bound(times: &[Timestamp], value: Timestamp) -> usize {
    times.partition_point(|&t| t <= value)
}

/// Position of the first element greater than or equal to `value`, or `times.len()`
pub fn lower_bound(times: &[Timestamp], value: Timestamp) -> usize {
    times.partition_point(|&t| t < value)
}
