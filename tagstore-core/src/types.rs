//! Core types for TagStore

use crate::{Result, TagStoreError};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Time column value; the unit is up to the caller
pub type Timestamp = i64;

/// Interned string surrogate, minted once per distinct string (1-based)
pub type StrRef = u32;

/// Denotes an unresolved string reference
pub const INVALID_STR_REF: StrRef = StrRef::MAX;

/// Raw column buffers keyed by column name, row-major, little-endian elements
pub type RawColumns = HashMap<String, Bytes>;

/// Half-open row range `[start, end)`
pub type Span = (usize, usize);

/// The empty row span
pub const EMPTY_SPAN: Span = (0, 0);

/// Element type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// Single byte
    Byte,
    /// Interned string reference ([`StrRef`])
    StringRef,
}

impl ColumnType {
    /// Size of a single element in bytes
    pub fn size(&self) -> usize {
        match self {
            ColumnType::Float => 4,
            ColumnType::Double => 8,
            ColumnType::Int32 => 4,
            ColumnType::Int64 => 8,
            ColumnType::Byte => 1,
            ColumnType::StringRef => std::mem::size_of::<StrRef>(),
        }
    }
}

/// Schema of a single value column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name, also the stem of its data file
    pub name: String,
    /// Element type
    pub column_type: ColumnType,
    /// Elements per row
    pub width: usize,
}

impl ColumnSchema {
    /// Create a column of width 1
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            width: 1,
        }
    }

    /// Set the number of elements per row
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }
}

/// Table schema: one int64 time column, string tag columns and typed value columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Name of the int64 time column
    pub time_column: String,
    /// Tag columns in priority order; constant within a sub table
    pub tag_columns: Vec<String>,
    /// Stored value columns
    pub value_columns: Vec<ColumnSchema>,
}

impl Schema {
    /// Create a schema with only a time column
    pub fn new(time_column: impl Into<String>) -> Self {
        Self {
            time_column: time_column.into(),
            tag_columns: Vec::new(),
            value_columns: Vec::new(),
        }
    }

    /// Add a tag column
    pub fn with_tag(mut self, name: impl Into<String>) -> Self {
        self.tag_columns.push(name.into());
        self
    }

    /// Add a value column
    pub fn with_value(mut self, column: ColumnSchema) -> Self {
        self.value_columns.push(column);
        self
    }

    /// Time column followed by the value columns; the columns with data files
    pub fn stored_columns(&self) -> Vec<String> {
        std::iter::once(self.time_column.clone())
            .chain(self.value_columns.iter().map(|c| c.name.clone()))
            .collect()
    }

    /// Check names are unique and usable as file names, widths are positive
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let names = std::iter::once(&self.time_column)
            .chain(self.tag_columns.iter())
            .chain(self.value_columns.iter().map(|c| &c.name));
        for name in names {
            validate_column_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Duplicate column name in schema: {}",
                    name
                )));
            }
        }
        for column in &self.value_columns {
            if column.width == 0 {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Column {} must have a width of at least 1",
                    column.name
                )));
            }
        }
        Ok(())
    }
}

fn validate_column_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(TagStoreError::InvalidArgument(format!(
            "Invalid column name: '{}'",
            name
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TagStoreError::InvalidArgument(format!(
            "Column name must not contain path separators: '{}'",
            name
        )));
    }
    Ok(())
}

/// Everything needed to create a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Column layout
    pub schema: Schema,
    /// Rows between two sparse index samples
    pub index_density: u64,
}

impl TableDefinition {
    /// Create a definition with the default index density
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            index_density: crate::config::DEFAULT_INDEX_DENSITY,
        }
    }

    /// Set the index density
    pub fn with_index_density(mut self, index_density: u64) -> Self {
        self.index_density = index_density;
        self
    }

    /// Validate schema and density
    pub fn validate(&self) -> Result<()> {
        if self.index_density == 0 {
            return Err(TagStoreError::InvalidArgument(
                "Index density must be positive".into(),
            ));
        }
        self.schema.validate()
    }
}

/// Identity of a sub table, derived from its tag values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTableId {
    /// Display id and directory name, e.g. `sub,s=GOOG,c=US`
    pub id: String,
    /// Tag column name to interned value
    pub tags: BTreeMap<String, StrRef>,
    /// Literal tag values in schema tag order
    pub str_tags: Vec<String>,
}

/// How [`crate::SubTable::append`] treats data that overlaps what is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AppendMode {
    /// Strict append; a timestamp below the last stored one is an error
    #[default]
    Append,
    /// Drop all stored rows, then append
    TruncateExisting,
    /// Replace stored rows from the first incoming timestamp onwards
    TruncateExistingOverlap,
    /// Silently drop a leading prefix of rows older than the last stored one
    SkipOverlap,
}

/// Time based row selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSelector {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub include_start: bool,
    pub include_end: bool,
    /// When set, selects the last N rows and ignores the range
    pub last_n: Option<u64>,
}

impl Default for TimeSelector {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            include_start: true,
            include_end: false,
            last_n: None,
        }
    }
}

impl TimeSelector {
    /// Half-open range `[start, end)`
    pub fn range(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    /// Rows with time >= start
    pub fn from_start(start: Timestamp) -> Self {
        Self {
            start: Some(start),
            ..Default::default()
        }
    }

    /// The last `n` rows
    pub fn last(n: u64) -> Self {
        Self {
            last_n: Some(n),
            ..Default::default()
        }
    }
}

/// Selects sub tables whose tag `name` has any of `value`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSelector {
    pub name: String,
    pub value: Vec<String>,
}

/// Sub table selection and ordering
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTableSelector {
    /// Intersected across entries; a tag without an entry matches everything
    pub tag_selector: Vec<TagSelector>,
    /// Tag columns to order sub tables by, highest priority first
    pub tag_order: Vec<String>,
}

/// A query: which columns, which rows, which sub tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub columns: Vec<String>,
    pub time_selector: TimeSelector,
    pub sub_table_selector: SubTableSelector,
}

impl Selector {
    /// Select the given columns over all rows of all sub tables
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the time selector
    pub fn with_time(mut self, time_selector: TimeSelector) -> Self {
        self.time_selector = time_selector;
        self
    }

    /// Restrict tag `name` to any of `values`
    pub fn with_tag<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_table_selector.tag_selector.push(TagSelector {
            name: name.into(),
            value: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Order sub tables by the literal value of tag `name` (appended with lower priority)
    pub fn order_by(mut self, name: impl Into<String>) -> Self {
        self.sub_table_selector.tag_order.push(name.into());
        self
    }
}

/// Typed column values at the API boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Float(Vec<f32>),
    Double(Vec<f64>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Byte(Vec<u8>),
    StringRef(Vec<StrRef>),
}

impl ColumnData {
    /// Element type
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Double(_) => ColumnType::Double,
            ColumnData::Int32(_) => ColumnType::Int32,
            ColumnData::Int64(_) => ColumnType::Int64,
            ColumnData::Byte(_) => ColumnType::Byte,
            ColumnData::StringRef(_) => ColumnType::StringRef,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Float(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Byte(v) => v.len(),
            ColumnData::StringRef(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode into the on-disk little-endian layout
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len() * self.column_type().size());
        match self {
            ColumnData::Float(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
            ColumnData::Double(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
            ColumnData::Int32(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
            ColumnData::Int64(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
            ColumnData::Byte(v) => buf.put_slice(v),
            ColumnData::StringRef(v) => v.iter().for_each(|x| buf.put_u32_le(*x)),
        }
        buf.freeze()
    }

    /// Decode a raw buffer of the given element type
    pub fn from_bytes(column_type: ColumnType, data: &[u8]) -> Result<Self> {
        let size = column_type.size();
        if data.len() % size != 0 {
            return Err(TagStoreError::InvalidFormat(format!(
                "Buffer of {} bytes is not a multiple of the {:?} element size {}",
                data.len(),
                column_type,
                size
            )));
        }
        let chunks = data.chunks_exact(size);
        Ok(match column_type {
            ColumnType::Float => ColumnData::Float(
                chunks.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect(),
            ),
            ColumnType::Double => {
                ColumnData::Double(chunks.map(|c| f64::from_le_bytes(to_array8(c))).collect())
            }
            ColumnType::Int32 => ColumnData::Int32(
                chunks.map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect(),
            ),
            ColumnType::Int64 => {
                ColumnData::Int64(chunks.map(|c| i64::from_le_bytes(to_array8(c))).collect())
            }
            ColumnType::Byte => ColumnData::Byte(data.to_vec()),
            ColumnType::StringRef => ColumnData::StringRef(
                chunks.map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect(),
            ),
        })
    }
}

fn to_array8(c: &[u8]) -> [u8; 8] {
    [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]
}

/// Decode a little-endian int64 buffer (the time column layout)
pub fn decode_timestamps(data: &[u8]) -> Result<Vec<Timestamp>> {
    match ColumnData::from_bytes(ColumnType::Int64, data)? {
        ColumnData::Int64(v) => Ok(v),
        _ => unreachable!("int64 decode yields int64 data"),
    }
}
