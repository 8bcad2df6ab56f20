//! Table storage - sharded column files under one root directory

mod column;
mod engine;
mod interner;
mod sub_table;

pub use column::ColumnMeta;
pub use engine::Table;
pub use interner::StringInterner;
pub use sub_table::SubTable;

use crate::meta::SyncPolicy;
use crate::RawColumns;
use std::path::PathBuf;

/// Table configuration
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Table root directory
    pub root_dir: PathBuf,
    /// Whether writes are synced to disk before returning
    pub sync_policy: SyncPolicy,
    /// Query fan-out stops once this many result bytes are accumulated
    pub query_result_limit: usize,
}

impl TableConfig {
    /// Default configuration rooted at `root_dir`
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Set the sync policy
    pub fn with_sync_policy(mut self, sync_policy: SyncPolicy) -> Self {
        self.sync_policy = sync_policy;
        self
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data"),
            sync_policy: SyncPolicy::default(),
            query_result_limit: crate::config::QUERY_RESULT_SOFT_LIMIT,
        }
    }
}

/// Result of a table query
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Requested columns, sub table results concatenated in iteration order
    pub columns: RawColumns,
    /// Number of sub tables that were queried
    pub sub_tables_scanned: usize,
    /// Set when the result size limit stopped the fan-out early
    pub truncated: bool,
}

impl QueryResult {
    /// Number of rows in the result
    pub fn num_rows(&self, time_column: &str) -> usize {
        self.columns
            .get(time_column)
            .map(|data| data.len() / std::mem::size_of::<crate::Timestamp>())
            .unwrap_or(0)
    }
}
