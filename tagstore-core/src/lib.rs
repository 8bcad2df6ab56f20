//! TagStore Core - Tag-Sharded Columnar Time-Series Tables
//!
//! An append-only table store for time-ordered numeric columns:
//! - Rows are sharded into sub tables, one per combination of tag values
//! - Each stored column is a flat little-endian file of fixed-width rows
//! - A sparse in-memory index over the time column bounds range queries
//! - Appends and truncations survive a crash at any point
//!
//! # Architecture
//!
//! - **meta**: crash-consistent metadata files (`.lock` / `.back` shadow copies)
//! - **index**: sparse `(time, row)` samples and the bound searches over them
//! - **table**: sub tables (one shard each), string interning and the
//!   [`Table`] that routes appends and fans queries out across shards

pub mod index;
pub mod meta;
pub mod table;

mod error;
mod types;

pub use error::{Result, TagStoreError};
pub use table::{QueryResult, SubTable, Table, TableConfig};
pub use types::*;

/// TagStore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Rows between two sparse index samples
    pub const DEFAULT_INDEX_DENSITY: u64 = 256;

    /// Soft cap on accumulated bytes during a multi sub table query (1GB)
    pub const QUERY_RESULT_SOFT_LIMIT: usize = 1 << 30;

    /// Metadata file name, both at the table root and inside each sub table
    pub const META_FILE: &str = "META.pb";

    /// String interning table file name
    pub const STR_REF_FILE: &str = "STR_REF.pb";

    /// Marker present while a sub table's column files may disagree with its meta
    pub const DATA_LOCK_FILE: &str = "DATA.lock";

    /// Extension of per-column data files
    pub const COLUMN_FILE_EXT: &str = "bin";

    /// Suffix of the marker written during a safe metadata write
    pub const LOCK_SUFFIX: &str = "lock";

    /// Suffix of the last known-good metadata copy
    pub const BACKUP_SUFFIX: &str = "back";
}
