//! Table - top-level coordinator routing rows to sub tables by tag values

use super::interner::StringInterner;
use super::sub_table::SubTable;
use super::{QueryResult, TableConfig};
use crate::config::{META_FILE, STR_REF_FILE};
use crate::meta;
use crate::{
    AppendMode, ColumnType, RawColumns, Result, Schema, Selector, Span, StrRef,
    SubTableId, SubTableSelector, TableDefinition, TagStoreError,
};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Persisted table metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    definition: TableDefinition,
    /// Every mounted sub table, in creation order
    sub_table_ids: Vec<SubTableId>,
}

/// Mounted sub tables and the indices over them
#[derive(Default)]
struct ShardRegistry {
    /// Creation order; handles below index into this
    sub_tables: Vec<Arc<SubTable>>,
    /// (tag column, literal value) -> sub tables with that value
    by_tag: HashMap<(String, String), Vec<usize>>,
    /// Tag refs in schema tag order -> sub table
    by_refs: HashMap<Vec<StrRef>, usize>,
}

/// A table: one schema, many sub tables, one string interning table
pub struct Table {
    config: TableConfig,
    meta_path: PathBuf,
    definition: TableDefinition,
    /// Stored columns with their row sizes, time column first
    non_tag_columns: Vec<(String, usize)>,
    /// Tag column name -> position in the schema
    tag_column_order: HashMap<String, usize>,
    interner: StringInterner,
    shards: RwLock<ShardRegistry>,
    poisoned: AtomicBool,
}

impl Table {
    /// Create the table at `config.root_dir`, or open it if it exists
    ///
    /// An existing table must have the same schema. Its persisted index
    /// density is kept even if `definition` asks for another one.
    pub fn open_or_create(config: TableConfig, definition: TableDefinition) -> Result<Self> {
        definition.validate()?;
        std::fs::create_dir_all(&config.root_dir)?;
        let meta_path = config.root_dir.join(META_FILE);

        let table_meta = match meta::read_safe::<TableMeta>(&meta_path)? {
            Some(stored) => {
                if stored.definition.schema != definition.schema {
                    return Err(TagStoreError::SchemaMismatch {
                        root: config.root_dir.display().to_string(),
                        existing: serde_json::to_string(&stored.definition.schema)
                            .map_err(|e| TagStoreError::InvalidFormat(e.to_string()))?,
                        provided: serde_json::to_string(&definition.schema)
                            .map_err(|e| TagStoreError::InvalidFormat(e.to_string()))?,
                    });
                }
                if stored.definition.index_density != definition.index_density {
                    warn!(
                        "Table at {:?} keeps its index density {} (requested {})",
                        config.root_dir,
                        stored.definition.index_density,
                        definition.index_density
                    );
                }
                stored
            }
            None => {
                let fresh = TableMeta {
                    definition,
                    sub_table_ids: Vec::new(),
                };
                meta::write_safe(&meta_path, &fresh, config.sync_policy)?;
                info!("Created table at {:?}", config.root_dir);
                fresh
            }
        };

        Self::load(config, meta_path, table_meta)
    }

    /// Open an existing table
    pub fn open(config: TableConfig) -> Result<Self> {
        let meta_path = config.root_dir.join(META_FILE);
        let table_meta = meta::read_safe::<TableMeta>(&meta_path)?
            .ok_or_else(|| TagStoreError::TableNotFound(config.root_dir.display().to_string()))?;
        table_meta.definition.validate()?;
        Self::load(config, meta_path, table_meta)
    }

    fn load(config: TableConfig, meta_path: PathBuf, table_meta: TableMeta) -> Result<Self> {
        let schema = &table_meta.definition.schema;
        let interner =
            StringInterner::open(config.root_dir.join(STR_REF_FILE), config.sync_policy)?;

        let mut non_tag_columns = vec![(
            schema.time_column.clone(),
            ColumnType::Int64.size(),
        )];
        non_tag_columns.extend(
            schema
                .value_columns
                .iter()
                .map(|c| (c.name.clone(), c.column_type.size() * c.width)),
        );
        let tag_column_order = schema
            .tag_columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let table = Self {
            meta_path,
            definition: table_meta.definition.clone(),
            non_tag_columns,
            tag_column_order,
            interner,
            shards: RwLock::new(ShardRegistry::default()),
            poisoned: AtomicBool::new(false),
            config,
        };

        {
            let mut registry = table.shards.write();
            for id in table_meta.sub_table_ids {
                let sub_table = table.open_sub_table(id)?;
                table.mount(&mut registry, sub_table)?;
            }
        }
        info!(
            "Opened table at {:?} with {} sub tables",
            table.config.root_dir,
            table.num_sub_tables()
        );
        Ok(table)
    }

    /// Table schema
    pub fn schema(&self) -> &Schema {
        &self.definition.schema
    }

    /// Rows between two sparse index samples
    pub fn index_density(&self) -> u64 {
        self.definition.index_density
    }

    /// Table root directory
    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// Ids of all sub tables in creation order
    pub fn sub_table_ids(&self) -> Vec<SubTableId> {
        self.shards
            .read()
            .sub_tables
            .iter()
            .map(|s| s.id().clone())
            .collect()
    }

    /// Number of mounted sub tables
    pub fn num_sub_tables(&self) -> usize {
        self.shards.read().sub_tables.len()
    }

    /// The sub table holding the given literal tag values, if it exists
    pub fn sub_table(&self, str_tags: &HashMap<String, String>) -> Option<Arc<SubTable>> {
        let refs = self
            .schema()
            .tag_columns
            .iter()
            .map(|column| {
                str_tags
                    .get(column)
                    .and_then(|value| self.interner.lookup(value))
            })
            .collect::<Option<Vec<StrRef>>>()?;
        let registry = self.shards.read();
        registry
            .by_refs
            .get(&refs)
            .map(|&handle| registry.sub_tables[handle].clone())
    }

    /// Intern strings, minting references for the unknown ones
    pub fn mint_string_refs<S: AsRef<str>>(&self, strings: &[S]) -> Result<Vec<StrRef>> {
        self.check_poisoned()?;
        self.interner.mint(strings)
    }

    /// Resolve references back to strings, `None` for unknown references
    pub fn resolve_string_refs(&self, refs: &[StrRef]) -> Vec<Option<String>> {
        self.interner.resolve(refs)
    }

    /// Build the canonical sub table id for the given literal tag values
    ///
    /// Every tag column needs a value. Values are minted as a side effect.
    pub fn make_sub_table_id(&self, str_tags: &HashMap<String, String>) -> Result<SubTableId> {
        self.check_poisoned()?;
        for name in str_tags.keys() {
            if !self.tag_column_order.contains_key(name) {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Unknown tag column: {}",
                    name
                )));
            }
        }
        let values = self
            .schema()
            .tag_columns
            .iter()
            .map(|column| {
                str_tags.get(column).cloned().ok_or_else(|| {
                    TagStoreError::InvalidArgument(format!(
                        "Missing value for tag column {}",
                        column
                    ))
                })
            })
            .collect::<Result<Vec<String>>>()?;
        self.sub_table_id_from_values(values)
    }

    fn sub_table_id_from_values(&self, values: Vec<String>) -> Result<SubTableId> {
        // The id is also the directory name, so it must be unambiguous and stay inside root.
        if let Some(bad) = values
            .iter()
            .find(|v| v.contains(['/', '\\', '\0', ',', '=']))
        {
            return Err(TagStoreError::InvalidArgument(format!(
                "Tag value must not contain '/', '\\', ',', '=' or NUL: '{}'",
                bad
            )));
        }
        let refs = self.interner.mint(&values)?;
        let tag_columns = &self.schema().tag_columns;

        let mut id = String::from("sub");
        for (column, value) in tag_columns.iter().zip(&values) {
            id.push(',');
            id.push_str(column);
            id.push('=');
            id.push_str(value);
        }
        Ok(SubTableId {
            id,
            tags: tag_columns.iter().cloned().zip(refs).collect(),
            str_tags: values,
        })
    }

    /// The sub table for a tuple of tag references (schema tag order), created on first use
    pub fn get_or_create_sub_table(&self, tag_refs: &[StrRef]) -> Result<Arc<SubTable>> {
        self.check_poisoned()?;
        let num_tags = self.schema().tag_columns.len();
        if tag_refs.len() != num_tags {
            return Err(TagStoreError::InvalidArgument(format!(
                "Expected {} tag values, got {}",
                num_tags,
                tag_refs.len()
            )));
        }

        {
            let registry = self.shards.read();
            if let Some(&handle) = registry.by_refs.get(tag_refs) {
                return Ok(registry.sub_tables[handle].clone());
            }
        }

        let mut registry = self.shards.write();
        // Another writer may have created it in between.
        if let Some(&handle) = registry.by_refs.get(tag_refs) {
            return Ok(registry.sub_tables[handle].clone());
        }

        let values = tag_refs
            .iter()
            .zip(self.interner.resolve(tag_refs))
            .map(|(&str_ref, value)| value.ok_or(TagStoreError::UnresolvedStrRef(str_ref)))
            .collect::<Result<Vec<String>>>()?;
        let id = self.sub_table_id_from_values(values)?;
        let sub_table = self.open_sub_table(id)?;

        let stored = TableMeta {
            definition: self.definition.clone(),
            sub_table_ids: registry
                .sub_tables
                .iter()
                .map(|s| s.id().clone())
                .chain(std::iter::once(sub_table.id().clone()))
                .collect(),
        };
        if let Err(e) = meta::write_safe(&self.meta_path, &stored, self.config.sync_policy) {
            if e.is_fatal() {
                error!("Table at {:?} poisoned", self.config.root_dir);
                self.poisoned.store(true, Ordering::Release);
            }
            return Err(e);
        }

        info!("Created sub table {}", sub_table.id().id);
        self.mount(&mut registry, sub_table)
    }

    /// Append rows of any number of sub tables
    ///
    /// `columns` must hold every schema column; tag columns hold [`StrRef`]s.
    /// Each maximal run of rows with equal tags goes to its sub table as one
    /// append, so atomicity is per run: a failing run leaves earlier runs in.
    pub fn append(&self, columns: &RawColumns, mode: AppendMode) -> Result<()> {
        self.check_poisoned()?;
        let total_rows = self.validate_append(columns)?;
        if total_rows == 0 {
            return Ok(());
        }

        let tag_values: Vec<Vec<StrRef>> = self
            .schema()
            .tag_columns
            .iter()
            .map(|name| {
                columns[name]
                    .chunks_exact(ColumnType::StringRef.size())
                    .map(|c| StrRef::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            })
            .collect();
        let tags_at = |row: usize| -> Vec<StrRef> { tag_values.iter().map(|col| col[row]).collect() };

        // A sub table seen twice in one call must not be truncated twice.
        let mut touched: HashSet<Vec<StrRef>> = HashSet::new();
        let mut run_start = 0;
        for row in 1..=total_rows {
            let run_ends = row == total_rows
                || tag_values.iter().any(|col| col[row] != col[run_start]);
            if !run_ends {
                continue;
            }
            let tag_refs = tags_at(run_start);
            let run_mode = if mode == AppendMode::TruncateExisting && touched.contains(&tag_refs) {
                AppendMode::Append
            } else {
                mode
            };
            self.append_run(columns, &tag_refs, (run_start, row), run_mode)?;
            touched.insert(tag_refs);
            run_start = row;
        }
        debug!(
            "Appended {} rows to {} sub tables",
            total_rows,
            touched.len()
        );
        Ok(())
    }

    /// Check every schema column is present with a consistent size, returning the row count
    fn validate_append(&self, columns: &RawColumns) -> Result<usize> {
        let schema = self.schema();
        let num_columns = self.non_tag_columns.len() + schema.tag_columns.len();
        for name in columns.keys() {
            if !self.has_column(name) {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Unknown column: {}",
                    name
                )));
            }
        }
        if columns.len() != num_columns {
            return Err(TagStoreError::InvalidArgument(format!(
                "Must specify data for all {} columns, got {}",
                num_columns,
                columns.len()
            )));
        }

        let (time_column, time_row_size) = &self.non_tag_columns[0];
        let time_len = columns[time_column].len();
        if time_len % time_row_size != 0 {
            return Err(TagStoreError::InvalidArgument(format!(
                "Time column size {} is not a multiple of {}",
                time_len, time_row_size
            )));
        }
        let total_rows = time_len / time_row_size;

        let tag_row_size = ColumnType::StringRef.size();
        let expected_sizes = self
            .non_tag_columns
            .iter()
            .map(|(name, row_size)| (name, *row_size))
            .chain(schema.tag_columns.iter().map(|name| (name, tag_row_size)));
        for (name, row_size) in expected_sizes {
            let actual = columns[name].len();
            if actual != row_size * total_rows {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Unexpected number of rows for column {}: expected {} bytes, got {}",
                    name,
                    row_size * total_rows,
                    actual
                )));
            }
        }
        Ok(total_rows)
    }

    fn append_run(
        &self,
        columns: &RawColumns,
        tag_refs: &[StrRef],
        span: Span,
        mode: AppendMode,
    ) -> Result<()> {
        let sub_table = self.get_or_create_sub_table(tag_refs)?;
        let sub_columns: RawColumns = self
            .non_tag_columns
            .iter()
            .map(|(name, row_size)| {
                let data = columns[name].slice(span.0 * row_size..span.1 * row_size);
                (name.clone(), data)
            })
            .collect();
        sub_table.append(&sub_columns, mode)
    }

    /// Query the selected sub tables and concatenate their results
    ///
    /// Returns `None` when no row matches.
    pub fn query(&self, selector: &Selector) -> Result<Option<QueryResult>> {
        self.check_poisoned()?;
        if let Some(name) = selector.columns.iter().find(|c| !self.has_column(c)) {
            return Err(TagStoreError::InvalidArgument(format!(
                "Unknown column: {}",
                name
            )));
        }
        let sub_tables = self.select_sub_tables(&selector.sub_table_selector)?;
        if sub_tables.is_empty() {
            return Ok(None);
        }

        let mut parts: HashMap<String, Vec<Bytes>> = HashMap::new();
        let mut result_size = 0usize;
        let mut sub_tables_scanned = 0;
        let mut truncated = false;
        for sub_table in &sub_tables {
            if result_size > self.config.query_result_limit {
                warn!(
                    "Query result over {} bytes, stopping after {} of {} sub tables",
                    self.config.query_result_limit,
                    sub_tables_scanned,
                    sub_tables.len()
                );
                truncated = true;
                break;
            }
            sub_tables_scanned += 1;
            let Some(sub_result) = sub_table.query(selector)? else {
                continue;
            };
            for (column, data) in sub_result {
                result_size += data.len();
                parts.entry(column).or_default().push(data);
            }
        }
        if result_size == 0 {
            return Ok(None);
        }

        let columns = parts
            .into_iter()
            .map(|(column, column_parts)| (column, concat(column_parts)))
            .collect();
        debug!(
            "Query scanned {} sub tables, {} bytes",
            sub_tables_scanned, result_size
        );
        Ok(Some(QueryResult {
            columns,
            sub_tables_scanned,
            truncated,
        }))
    }

    /// Sub tables matching every tag selector, in creation or requested tag order
    fn select_sub_tables(&self, selector: &SubTableSelector) -> Result<Vec<Arc<SubTable>>> {
        let order = selector
            .tag_order
            .iter()
            .map(|name| {
                self.tag_column_order.get(name).copied().ok_or_else(|| {
                    TagStoreError::InvalidArgument(format!("Unknown tag column to order by: {}", name))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let registry = self.shards.read();
        let mut selection: Vec<usize> = (0..registry.sub_tables.len()).collect();
        for tag_selector in &selector.tag_selector {
            let matching: HashSet<usize> = tag_selector
                .value
                .iter()
                .filter_map(|value| {
                    registry
                        .by_tag
                        .get(&(tag_selector.name.clone(), value.clone()))
                })
                .flatten()
                .copied()
                .collect();
            selection.retain(|handle| matching.contains(handle));
        }

        let mut result: Vec<Arc<SubTable>> = selection
            .into_iter()
            .map(|handle| registry.sub_tables[handle].clone())
            .collect();
        drop(registry);

        if !order.is_empty() {
            result.sort_by(|a, b| {
                let (a, b) = (&a.id().str_tags, &b.id().str_tags);
                order
                    .iter()
                    .map(|&i| a[i].cmp(&b[i]))
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        Ok(result)
    }

    fn open_sub_table(&self, id: SubTableId) -> Result<SubTable> {
        SubTable::open(
            &self.config.root_dir,
            &self.definition.schema,
            self.definition.index_density,
            id,
            self.config.sync_policy,
        )
    }

    fn mount(&self, registry: &mut ShardRegistry, sub_table: SubTable) -> Result<Arc<SubTable>> {
        let id = sub_table.id();
        let tag_columns = &self.schema().tag_columns;
        if id.str_tags.len() != tag_columns.len() {
            return Err(TagStoreError::Corruption(format!(
                "Sub table {} has {} tag values, schema has {} tag columns",
                id.id,
                id.str_tags.len(),
                tag_columns.len()
            )));
        }
        let key = tag_columns
            .iter()
            .map(|column| {
                id.tags.get(column).copied().ok_or_else(|| {
                    TagStoreError::Corruption(format!(
                        "Tag for column {} not found in sub table id {}",
                        column, id.id
                    ))
                })
            })
            .collect::<Result<Vec<StrRef>>>()?;
        if registry.by_refs.contains_key(&key) {
            return Err(TagStoreError::Corruption(format!(
                "Sub table {} is mounted twice",
                id.id
            )));
        }

        let handle = registry.sub_tables.len();
        for (column, value) in tag_columns.iter().zip(&id.str_tags) {
            registry
                .by_tag
                .entry((column.clone(), value.clone()))
                .or_default()
                .push(handle);
        }
        registry.by_refs.insert(key, handle);
        debug!("Mounted sub table {}", id.id);

        let sub_table = Arc::new(sub_table);
        registry.sub_tables.push(sub_table.clone());
        Ok(sub_table)
    }

    fn has_column(&self, name: &str) -> bool {
        self.non_tag_columns.iter().any(|(c, _)| c == name)
            || self.tag_column_order.contains_key(name)
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) || self.interner.is_poisoned() {
            return Err(TagStoreError::Fatal(format!(
                "Table at {:?} is in an unrecoverable state after an earlier failure",
                self.config.root_dir
            )));
        }
        Ok(())
    }
}


fn concat(parts: Vec<Bytes>) -> Bytes {
    if parts.len() == 1 {
        return parts.into_iter().next().unwrap_or_default();
    }
    let mut buf = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
    for part in parts {
        buf.extend_from_slice(&part);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::SyncPolicy;
    use crate::{ColumnData, ColumnSchema, TimeSelector};
    use tempfile::TempDir;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn definition() -> TableDefinition {
        TableDefinition::new(
            Schema::new("t")
                .with_tag("s")
                .with_tag("c")
                .with_value(ColumnSchema::new("v", ColumnType::Float)),
        )
    }

    fn config(dir: &TempDir) -> TableConfig {
        TableConfig::new(dir.path()).with_sync_policy(SyncPolicy::None)
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Rows {
        t: Vec<i64>,
        s: Vec<StrRef>,
        c: Vec<StrRef>,
        v: Vec<f32>,
    }

    impl Rows {
        fn columns(&self) -> RawColumns {
            RawColumns::from([
                ("t".to_string(), ColumnData::Int64(self.t.clone()).to_bytes()),
                ("s".to_string(), ColumnData::StringRef(self.s.clone()).to_bytes()),
                ("c".to_string(), ColumnData::StringRef(self.c.clone()).to_bytes()),
                ("v".to_string(), ColumnData::Float(self.v.clone()).to_bytes()),
            ])
        }

        fn from_result(result: &QueryResult) -> Self {
            let decode = |name: &str, column_type| {
                ColumnData::from_bytes(column_type, &result.columns[name]).unwrap()
            };
            match (
                decode("t", ColumnType::Int64),
                decode("s", ColumnType::StringRef),
                decode("c", ColumnType::StringRef),
                decode("v", ColumnType::Float),
            ) {
                (
                    ColumnData::Int64(t),
                    ColumnData::StringRef(s),
                    ColumnData::StringRef(c),
                    ColumnData::Float(v),
                ) => Rows { t, s, c, v },
                other => panic!("unexpected column types: {:?}", other),
            }
        }
    }

    fn check(table: &Table, selector: &Selector, expected: Option<Rows>) {
        let result = table.query(selector).unwrap();
        match expected {
            None => assert!(result.is_none(), "expected no rows"),
            Some(expected) => {
                let result = result.expect("expected rows");
                assert_eq!(result.columns.len(), 4);
                assert!(!result.truncated);
                assert_eq!(Rows::from_result(&result), expected);
            }
        }
    }

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_table_workflow() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        {
            let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
            assert_eq!(table.schema(), &definition().schema);
            assert_eq!(table.index_density(), 256);
        }
        {
            let table = Table::open(config(&temp_dir)).unwrap();
            assert_eq!(table.schema(), &definition().schema);
            assert_eq!(table.mint_string_refs(&["hello", "a world", "this"]).unwrap(), vec![1, 2, 3]);
            assert_eq!(table.resolve_string_refs(&[1]), vec![Some("hello".to_string())]);
        }

        let table = Table::open(config(&temp_dir)).unwrap();
        assert_eq!(table.resolve_string_refs(&[3])[0].as_deref(), Some("this"));

        let sub1_part1 = Rows {
            t: vec![1, 2, 3],
            s: vec![1, 1, 1],
            c: vec![2, 2, 2],
            v: vec![3.0, 2.0, 1.0],
        };
        table.append(&sub1_part1.columns(), AppendMode::Append).unwrap();

        let table = Table::open(config(&temp_dir)).unwrap();
        let mut sel = Selector::columns(["t", "v", "s", "c"]).order_by("s");
        check(&table, &sel, Some(sub1_part1));

        let sub1_part2 = Rows {
            t: vec![4, 5, 6],
            s: vec![1, 1, 1],
            c: vec![2, 2, 2],
            v: vec![3.0, 5.0, 1.0],
        };
        table.append(&sub1_part2.columns(), AppendMode::Append).unwrap();
        check(
            &table,
            &sel,
            Some(Rows {
                t: vec![1, 2, 3, 4, 5, 6],
                s: vec![1; 6],
                c: vec![2; 6],
                v: vec![3.0, 2.0, 1.0, 3.0, 5.0, 1.0],
            }),
        );

        // One row for the existing sub table, two for a new one.
        let mixed = Rows {
            t: vec![11, 33, 44],
            s: vec![1, 2, 2],
            c: vec![2, 3, 3],
            v: vec![44.0, 55.0, 66.0],
        };
        table.append(&mixed.columns(), AppendMode::Append).unwrap();
        assert_eq!(table.num_sub_tables(), 2);

        // "a world" sorts before "hello".
        let all_rows = Rows {
            t: vec![33, 44, 1, 2, 3, 4, 5, 6, 11],
            s: vec![2, 2, 1, 1, 1, 1, 1, 1, 1],
            c: vec![3, 3, 2, 2, 2, 2, 2, 2, 2],
            v: vec![55.0, 66.0, 3.0, 2.0, 1.0, 3.0, 5.0, 1.0, 44.0],
        };
        check(&table, &sel, Some(all_rows.clone()));

        let table = Table::open(config(&temp_dir)).unwrap();
        check(&table, &sel, Some(all_rows.clone()));

        let a_world_rows = Rows {
            t: vec![33, 44],
            s: vec![2, 2],
            c: vec![3, 3],
            v: vec![55.0, 66.0],
        };
        check(&table, &sel.clone().with_tag("s", ["a world"]), Some(a_world_rows.clone()));
        check(
            &table,
            &sel.clone().with_tag("s", ["a world", "giga"]),
            Some(a_world_rows.clone()),
        );
        check(
            &table,
            &sel.clone().with_tag("s", ["a world", "giga", "hello"]),
            Some(all_rows),
        );
        check(
            &table,
            &sel.clone()
                .with_tag("s", ["a world", "hello"])
                .with_tag("c", ["this"]),
            Some(a_world_rows),
        );
        check(&table, &sel.clone().with_tag("s", ["giga"]), None);
        check(&table, &sel.clone().with_tag("nope", ["hello"]), None);

        // Without an order, sub tables come in creation order.
        sel.sub_table_selector.tag_order.clear();
        check(
            &table,
            &sel.clone().with_time(TimeSelector::range(5, 40)),
            Some(Rows {
                t: vec![5, 6, 11, 33],
                s: vec![1, 1, 1, 2],
                c: vec![2, 2, 2, 3],
                v: vec![5.0, 1.0, 44.0, 55.0],
            }),
        );
    }

    #[test]
    fn test_time_range_across_sub_tables() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        let refs = table.mint_string_refs(&["GOOG", "US", "FB"]).unwrap();
        let (goog, us, fb) = (refs[0], refs[1], refs[2]);

        let shard_rows = |symbol: StrRef, times: std::ops::Range<i64>| {
            let n = times.clone().count();
            Rows {
                t: times.clone().collect(),
                s: vec![symbol; n],
                c: vec![us; n],
                v: times.map(|t| t as f32).collect(),
            }
        };
        for symbol in [goog, fb] {
            table
                .append(&shard_rows(symbol, 0..1000).columns(), AppendMode::Append)
                .unwrap();
            let shard = table.get_or_create_sub_table(&[symbol, us]).unwrap();
            assert_eq!(shard.index().pos, vec![0, 256, 512, 768]);

            table
                .append(&shard_rows(symbol, 1000..1900).columns(), AppendMode::Append)
                .unwrap();
            let index = shard.index();
            assert_eq!(index.pos, vec![0, 256, 512, 768, 1024, 1280, 1536, 1792]);
            assert_eq!(index.last_ts, 1899);
            assert_eq!(index.num_rows, 1900);
        }
        assert_eq!(table.num_sub_tables(), 2);

        // "FB" sorts before "GOOG"; each shard synthesizes its own tag columns.
        let sel = Selector::columns(["t", "s", "c", "v"])
            .with_time(TimeSelector::range(1200, 1205))
            .order_by("s");
        let mut expected = shard_rows(fb, 1200..1205);
        let goog_part = shard_rows(goog, 1200..1205);
        expected.t.extend(goog_part.t);
        expected.s.extend(goog_part.s);
        expected.c.extend(goog_part.c);
        expected.v.extend(goog_part.v);
        check(&table, &sel, Some(expected));

        check(
            &table,
            &sel.clone().with_tag("s", ["GOOG"]),
            Some(shard_rows(goog, 1200..1205)),
        );
    }

    #[test]
    fn test_interleaved_tags_are_routed() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        let refs = table.mint_string_refs(&["GOOG", "FB", "US"]).unwrap();
        let (goog, fb, us) = (refs[0], refs[1], refs[2]);

        let rows = Rows {
            t: vec![1, 1, 2, 2, 3, 3],
            s: vec![goog, fb, goog, fb, goog, fb],
            c: vec![us; 6],
            v: vec![10.0, 20.0, 11.0, 21.0, 12.0, 22.0],
        };
        table.append(&rows.columns(), AppendMode::Append).unwrap();
        assert_eq!(table.num_sub_tables(), 2);

        let goog_table = table.sub_table(&tags(&[("s", "GOOG"), ("c", "US")])).unwrap();
        assert_eq!(goog_table.id().id, "sub,s=GOOG,c=US");
        assert_eq!(goog_table.num_rows(), 3);
        assert!(table.sub_table(&tags(&[("s", "MSFT"), ("c", "US")])).is_none());

        let result = table
            .query(&Selector::columns(["v"]).with_tag("s", ["FB"]))
            .unwrap()
            .unwrap();
        assert_eq!(
            ColumnData::from_bytes(ColumnType::Float, &result.columns["v"]).unwrap(),
            ColumnData::Float(vec![20.0, 21.0, 22.0])
        );

        // Interleaved runs of a sub table are truncated once per call.
        let replacement = Rows {
            t: vec![7, 7, 8, 8],
            s: vec![goog, fb, goog, fb],
            c: vec![us; 4],
            v: vec![1.0, 2.0, 3.0, 4.0],
        };
        table
            .append(&replacement.columns(), AppendMode::TruncateExisting)
            .unwrap();
        assert_eq!(goog_table.num_rows(), 2);
        assert_eq!(goog_table.index().last_ts, 8);
    }

    #[test]
    fn test_unminted_tag_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        table.mint_string_refs(&["GOOG"]).unwrap();

        let rows = Rows {
            t: vec![1],
            s: vec![1],
            c: vec![42],
            v: vec![0.0],
        };
        let err = table.append(&rows.columns(), AppendMode::Append).unwrap_err();
        assert!(matches!(err, TagStoreError::UnresolvedStrRef(42)));
        assert_eq!(table.num_sub_tables(), 0);
    }

    #[test]
    fn test_append_validation() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        let rows = Rows {
            t: vec![1, 2],
            s: vec![1, 1],
            c: vec![1, 1],
            v: vec![0.0, 1.0],
        };

        let mut missing_tag = rows.columns();
        missing_tag.remove("c");
        assert!(table.append(&missing_tag, AppendMode::Append).unwrap_err().is_validation());

        let mut extra = rows.columns();
        extra.insert("x".into(), Bytes::new());
        assert!(table.append(&extra, AppendMode::Append).unwrap_err().is_validation());

        let mut short_tag = rows.columns();
        short_tag.insert("s".into(), ColumnData::StringRef(vec![1]).to_bytes());
        assert!(table.append(&short_tag, AppendMode::Append).unwrap_err().is_validation());

        assert!(table.append(&Rows::default().columns(), AppendMode::Append).is_ok());
        assert_eq!(table.num_sub_tables(), 0);
    }

    #[test]
    fn test_open_missing_table() {
        let temp_dir = TempDir::new().unwrap();
        let err = Table::open(config(&temp_dir)).err().unwrap();
        assert!(matches!(err, TagStoreError::TableNotFound(_)));
    }

    #[test]
    fn test_schema_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        drop(Table::open_or_create(config(&temp_dir), definition()).unwrap());

        let other = TableDefinition::new(Schema::new("t").with_tag("s"));
        let err = Table::open_or_create(config(&temp_dir), other).err().unwrap();
        assert!(matches!(err, TagStoreError::SchemaMismatch { .. }));
        assert!(err.to_string().contains("\"time_column\":\"t\""));
    }

    #[test]
    fn test_persisted_density_wins() {
        let temp_dir = TempDir::new().unwrap();
        drop(Table::open_or_create(config(&temp_dir), definition().with_index_density(4)).unwrap());
        let table =
            Table::open_or_create(config(&temp_dir), definition().with_index_density(512)).unwrap();
        assert_eq!(table.index_density(), 4);
    }

    #[test]
    fn test_make_sub_table_id() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();

        let id = table.make_sub_table_id(&tags(&[("c", "US"), ("s", "GOOG")])).unwrap();
        assert_eq!(id.id, "sub,s=GOOG,c=US");
        assert_eq!(id.str_tags, vec!["GOOG".to_string(), "US".to_string()]);
        assert_eq!(id.tags["s"], 1);
        assert_eq!(id.tags["c"], 2);

        assert!(table.make_sub_table_id(&tags(&[("s", "GOOG")])).unwrap_err().is_validation());
        assert!(table
            .make_sub_table_id(&tags(&[("s", "../x"), ("c", "US")]))
            .unwrap_err()
            .is_validation());
        assert!(table
            .make_sub_table_id(&tags(&[("s", "A"), ("c", "US"), ("z", "1")]))
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_separators_in_tag_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        // ("x,c=y", "z") and ("x", "y,c=z") would both render as "sub,s=x,c=y,c=z".
        let refs = table.mint_string_refs(&["x,c=y", "z", "x", "y,c=z"]).unwrap();

        let first = Rows {
            t: vec![1, 2, 3],
            s: vec![refs[0]; 3],
            c: vec![refs[1]; 3],
            v: vec![1.0, 2.0, 3.0],
        };
        assert!(table.append(&first.columns(), AppendMode::Append).unwrap_err().is_validation());

        let second = Rows {
            t: vec![10],
            s: vec![refs[2]],
            c: vec![refs[3]],
            v: vec![10.0],
        };
        assert!(table.append(&second.columns(), AppendMode::Append).unwrap_err().is_validation());
        assert_eq!(table.num_sub_tables(), 0);

        assert!(table
            .make_sub_table_id(&tags(&[("s", "a=b"), ("c", "US")]))
            .unwrap_err()
            .is_validation());

        let plain = Rows {
            t: vec![10],
            s: vec![refs[2]],
            c: vec![refs[1]],
            v: vec![10.0],
        };
        table.append(&plain.columns(), AppendMode::Append).unwrap();
        assert_eq!(table.sub_table_ids()[0].id, "sub,s=x,c=z");
        check(
            &table,
            &Selector::columns(["t", "s", "c", "v"]).with_tag("s", ["x"]),
            Some(plain),
        );
    }

    #[test]
    fn test_failed_mint_poisons_table() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        assert_eq!(table.mint_string_refs(&["GOOG", "US"]).unwrap(), vec![1, 2]);

        let str_ref_path = temp_dir.path().join(STR_REF_FILE);
        std::fs::remove_file(&str_ref_path).unwrap();
        std::fs::create_dir(&str_ref_path).unwrap();

        assert!(table.mint_string_refs(&["X"]).unwrap_err().is_fatal());
        // The reference that failed to persist is never handed out.
        assert_eq!(table.resolve_string_refs(&[3]), vec![None]);

        assert!(table.get_or_create_sub_table(&[1, 2]).unwrap_err().is_fatal());
        let rows = Rows {
            t: vec![1],
            s: vec![1],
            c: vec![2],
            v: vec![0.0],
        };
        assert!(table.append(&rows.columns(), AppendMode::Append).unwrap_err().is_fatal());
        assert!(table.query(&Selector::columns(["t"])).unwrap_err().is_fatal());
        assert_eq!(table.num_sub_tables(), 0);
    }

    #[test]
    fn test_failed_meta_cleanup_poisons_table() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        let refs = table.mint_string_refs(&["GOOG", "US", "FB"]).unwrap();
        table.get_or_create_sub_table(&[refs[0], refs[1]]).unwrap();

        // Registering the next sub table cannot remove the meta lock marker.
        let meta_lock = meta::lock_path(&temp_dir.path().join(META_FILE));
        std::fs::create_dir(&meta_lock).unwrap();

        let err = table.get_or_create_sub_table(&[refs[2], refs[1]]).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(table.num_sub_tables(), 1);
        assert!(table.get_or_create_sub_table(&[refs[0], refs[1]]).unwrap_err().is_fatal());
        assert!(table.query(&Selector::columns(["t"])).unwrap_err().is_fatal());
    }

    #[test]
    fn test_query_validation() {
        let temp_dir = TempDir::new().unwrap();
        let table = Table::open_or_create(config(&temp_dir), definition()).unwrap();
        assert!(table.query(&Selector::columns(["nope"])).unwrap_err().is_validation());
        assert!(table
            .query(&Selector::columns(["t"]).order_by("v"))
            .unwrap_err()
            .is_validation());
        assert!(table.query(&Selector::columns(["t"])).unwrap().is_none());
    }

    #[test]
    fn test_query_result_limit() {
        let temp_dir = TempDir::new().unwrap();
        let mut table_config = config(&temp_dir);
        table_config.query_result_limit = 1;
        let table = Table::open_or_create(table_config, definition()).unwrap();
        table.mint_string_refs(&["A", "B", "C"]).unwrap();

        let rows = Rows {
            t: vec![1, 2, 3],
            s: vec![1, 2, 3],
            c: vec![1, 1, 1],
            v: vec![0.0, 0.0, 0.0],
        };
        table.append(&rows.columns(), AppendMode::Append).unwrap();

        let result = table.query(&Selector::columns(["t"])).unwrap().unwrap();
        assert!(result.truncated);
        assert_eq!(result.sub_tables_scanned, 1);
        assert_eq!(result.num_rows("t"), 1);
    }

    #[test]
    fn test_table_without_tags() {
        let temp_dir = TempDir::new().unwrap();
        let definition = TableDefinition::new(
            Schema::new("time").with_value(ColumnSchema::new("x", ColumnType::Double)),
        );
        let table = Table::open_or_create(config(&temp_dir), definition).unwrap();

        let columns = RawColumns::from([
            ("time".to_string(), ColumnData::Int64(vec![1, 2]).to_bytes()),
            ("x".to_string(), ColumnData::Double(vec![0.5, 1.5]).to_bytes()),
        ]);
        table.append(&columns, AppendMode::Append).unwrap();
        assert_eq!(table.sub_table_ids()[0].id, "sub");

        let result = table.query(&Selector::columns(["x"])).unwrap().unwrap();
        assert_eq!(
            ColumnData::from_bytes(ColumnType::Double, &result.columns["x"]).unwrap(),
            ColumnData::Double(vec![0.5, 1.5])
        );
    }

    #[test]
    fn test_concurrent_appends_and_queries() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let table = Arc::new(Table::open_or_create(config(&temp_dir), definition()).unwrap());
        let symbols = ["A", "B", "C", "D"];

        let mut handles = Vec::new();
        for symbol in symbols {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let refs = table.mint_string_refs(&[symbol, "US"]).unwrap();
                for batch in 0..10i64 {
                    let rows = Rows {
                        t: (batch * 100..(batch + 1) * 100).collect(),
                        s: vec![refs[0]; 100],
                        c: vec![refs[1]; 100],
                        v: vec![1.0; 100],
                    };
                    table.append(&rows.columns(), AppendMode::Append).unwrap();
                    table.query(&Selector::columns(["t", "v"])).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.num_sub_tables(), 4);
        let result = table.query(&Selector::columns(["t"])).unwrap().unwrap();
        assert_eq!(result.num_rows("t"), 4000);
        assert_eq!(result.sub_tables_scanned, 4);

        for symbol in symbols {
            let result = table
                .query(&Selector::columns(["t"]).with_tag("s", [symbol]))
                .unwrap()
                .unwrap();
            assert_eq!(
                ColumnData::from_bytes(ColumnType::Int64, &result.columns["t"]).unwrap(),
                ColumnData::Int64((0..1000).collect())
            );
        }

        drop(table);
        let table = Table::open(config(&temp_dir)).unwrap();
        assert_eq!(table.num_sub_tables(), 4);
    }
}
