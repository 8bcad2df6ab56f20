//! Sparse time index
//!
//! Every `index_density`-th row contributes a `(time, row)` sample. The
//! samples bound a time range to a coarse row span without touching disk;
//! only that span of the time column is then read and searched exactly.

mod search;

pub use search::{lower_bound, upper_bound};

use crate::{Span, Timestamp, EMPTY_SPAN};
use serde::{Deserialize, Serialize};

/// Sparse index over a sub table's time column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Sampled time values, ascending
    pub value: Vec<Timestamp>,
    /// Row positions of the samples; starts with 0
    pub pos: Vec<usize>,
    /// Time of the last row, `i64::MIN` when empty
    pub last_ts: Timestamp,
    /// Number of rows
    pub num_rows: usize,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            value: Vec::new(),
            pos: Vec::new(),
            last_ts: Timestamp::MIN,
            num_rows: 0,
        }
    }
}

impl Index {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Record one appended row with time `ts`
    pub fn push(&mut self, ts: Timestamp, index_density: u64) {
        self.last_ts = ts;
        if self.num_rows as u64 % index_density == 0 {
            self.value.push(ts);
            self.pos.push(self.num_rows);
        }
        self.num_rows += 1;
    }

    /// Keep the first `num_rows` rows; `last_ts` is the time of row `num_rows - 1`
    pub fn truncate(&mut self, num_rows: usize, last_ts: Timestamp) {
        if num_rows == 0 {
            *self = Self::default();
            return;
        }
        let keep = self.pos.partition_point(|&p| p < num_rows);
        self.pos.truncate(keep);
        self.value.truncate(keep);
        self.num_rows = num_rows;
        self.last_ts = last_ts;
    }

    /// A row span guaranteed to contain every row with time in the given bounds
    ///
    /// Bounds are treated as inclusive; exclusivity is applied on the exact search.
    pub fn coarse_span(&self, start: Option<Timestamp>, end: Option<Timestamp>) -> Span {
        if self.num_rows == 0 {
            return EMPTY_SPAN;
        }
        if matches!(end, Some(end) if self.value[0] > end) {
            return EMPTY_SPAN;
        }
        if matches!(start, Some(start) if self.last_ts < start) {
            return EMPTY_SPAN;
        }

        let first = match start {
            // The sample before the first one >= start may still precede matching rows.
            Some(start) => self.pos[lower_bound(&self.value, start).saturating_sub(1)],
            None => 0,
        };
        let second = match end {
            Some(end) => {
                let k = upper_bound(&self.value, end);
                if k == self.value.len() {
                    self.num_rows
                } else {
                    self.pos[k]
                }
            }
            None => self.num_rows,
        };
        (first, second)
    }
}
