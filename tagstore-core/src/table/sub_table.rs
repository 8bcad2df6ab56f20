//! SubTable - one shard of a table, holding the rows of one tag combination
//!
//! On-disk layout of a sub table directory:
//! - `META.pb`: the sub table id and its serialized [`Index`] (safe-written)
//! - `<column>.bin`: one flat file per stored column, row `i` at `i * row_size`
//! - `DATA.lock`: present while column files may be longer than `META.pb` says
//!
//! `META.pb` is authoritative. Column files are only ever longer than the
//! persisted row count, never shorter, so recovery is a plain truncation.

use super::column::{resolve_columns, ColumnMeta};
use crate::config::{DATA_LOCK_FILE, META_FILE};
use crate::index::{lower_bound, upper_bound, Index};
use crate::meta::{self, SyncPolicy};
use crate::{
    decode_timestamps, AppendMode, RawColumns, Result, Schema, Selector, Span, SubTableId,
    TagStoreError, TimeSelector, Timestamp, EMPTY_SPAN,
};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Persisted sub table metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubTableMeta {
    id: SubTableId,
    index: Index,
}

#[derive(Debug)]
struct SubTableState {
    /// Index as last persisted in `META.pb`
    durable: Index,
    /// Working index; equals `durable` whenever the write lock is free
    index: Index,
}

/// A single shard: flat column files plus a sparse time index
#[derive(Debug)]
pub struct SubTable {
    id: SubTableId,
    dir: PathBuf,
    meta_path: PathBuf,
    lock_path: PathBuf,
    time_column: String,
    index_density: u64,
    columns: HashMap<String, ColumnMeta>,
    /// Time column first, then value columns in schema order
    stored_columns: Vec<String>,
    sync: SyncPolicy,
    state: RwLock<SubTableState>,
    poisoned: AtomicBool,
}

impl SubTable {
    /// Open the sub table `id` under `root_dir`, creating it if needed
    ///
    /// A leftover `DATA.lock` from a crash is recovered here.
    pub fn open(
        root_dir: &Path,
        schema: &Schema,
        index_density: u64,
        id: SubTableId,
        sync: SyncPolicy,
    ) -> Result<Self> {
        if index_density == 0 {
            return Err(TagStoreError::InvalidArgument(
                "Index density must be positive".into(),
            ));
        }
        let dir = root_dir.join(&id.id);
        fs::create_dir_all(&dir)?;

        let columns = resolve_columns(&dir, schema, &id)?;
        let stored_columns = schema.stored_columns();
        for name in &stored_columns {
            // Appending nothing creates the file if it does not exist yet.
            columns[name].append(&[], SyncPolicy::None)?;
        }

        let meta_path = dir.join(META_FILE);
        let index = match meta::read_safe::<SubTableMeta>(&meta_path)? {
            Some(stored) => {
                if stored.id.id != id.id {
                    return Err(TagStoreError::Corruption(format!(
                        "Inconsistent sub table id in {:?}: expected {}, found {}",
                        meta_path, id.id, stored.id.id
                    )));
                }
                stored.index
            }
            None => {
                let fresh = SubTableMeta {
                    id: id.clone(),
                    index: Index::new(),
                };
                meta::write_safe(&meta_path, &fresh, sync)?;
                fresh.index
            }
        };

        let sub_table = Self {
            id,
            lock_path: dir.join(DATA_LOCK_FILE),
            dir,
            meta_path,
            time_column: schema.time_column.clone(),
            index_density,
            columns,
            stored_columns,
            sync,
            state: RwLock::new(SubTableState {
                durable: index.clone(),
                index,
            }),
            poisoned: AtomicBool::new(false),
        };

        if sub_table.lock_path.exists() {
            let state = sub_table.state.read();
            sub_table.recover(&state)?;
        }
        debug!(
            "Opened sub table {} with {} rows",
            sub_table.id.id,
            sub_table.state.read().index.num_rows
        );
        Ok(sub_table)
    }

    /// Sub table identity
    pub fn id(&self) -> &SubTableId {
        &self.id
    }

    /// Directory holding this sub table's files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of the current index
    pub fn index(&self) -> Index {
        self.state.read().index.clone()
    }

    /// Number of rows
    pub fn num_rows(&self) -> usize {
        self.state.read().index.num_rows
    }

    /// Layout of column `name`
    pub fn column_meta(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.get(name)
    }

    /// Append a batch of rows
    ///
    /// `columns` must hold the time column and every value column, and no tag
    /// column. Either all accepted rows become visible or none do.
    pub fn append(&self, columns: &RawColumns, mode: AppendMode) -> Result<()> {
        self.check_poisoned()?;
        let mut state = self.state.write();
        let result = self.append_locked(&mut state, columns, mode);
        self.poison_on_fatal(result)
    }

    /// Drop every row after the first `num_rows`
    pub fn truncate(&self, num_rows: usize) -> Result<()> {
        self.check_poisoned()?;
        let mut state = self.state.write();
        let result = self.truncate_locked(&mut state, num_rows);
        self.poison_on_fatal(result)
    }

    /// Drop every row
    pub fn truncate_all(&self) -> Result<()> {
        self.truncate(0)
    }

    /// Read the selected columns over the selected rows, `None` if no row matches
    pub fn query(&self, selector: &Selector) -> Result<Option<RawColumns>> {
        self.check_poisoned()?;
        let mut columns_to_query: Vec<&str> = Vec::with_capacity(selector.columns.len());
        for name in &selector.columns {
            if !self.columns.contains_key(name) {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Unknown column: {}",
                    name
                )));
            }
            if !columns_to_query.contains(&name.as_str()) {
                columns_to_query.push(name);
            }
        }
        // The time column is read for span selection anyway.
        let return_time_column = columns_to_query.contains(&self.time_column.as_str());
        columns_to_query.retain(|name| *name != self.time_column);

        let state = self.state.read();
        let (span, time_data) =
            self.query_time_span(&state.index, &selector.time_selector, return_time_column)?;
        if span.0 >= span.1 {
            return Ok(None);
        }

        let mut result = RawColumns::with_capacity(columns_to_query.len() + 1);
        for name in columns_to_query {
            result.insert(name.to_string(), self.columns[name].read_span(span)?);
        }
        if let Some(time_data) = time_data {
            result.insert(self.time_column.clone(), time_data);
        }
        debug!("Query on {} selected rows {}..{}", self.id.id, span.0, span.1);
        Ok(Some(result))
    }

    fn append_locked(
        &self,
        state: &mut SubTableState,
        columns: &RawColumns,
        mode: AppendMode,
    ) -> Result<()> {
        let num_extra_rows = self.validate_append(columns)?;

        if self.lock_path.exists() {
            // A previous write did not finish; the loaded index is consistent.
            self.recover(state)?;
        }
        if mode == AppendMode::TruncateExisting {
            self.truncate_locked(state, 0)?;
        }
        if num_extra_rows == 0 {
            return Ok(());
        }
        let time = decode_timestamps(&columns[&self.time_column])?;

        if mode == AppendMode::TruncateExistingOverlap && !state.index.is_empty() {
            let first = time[0];
            // Starting before all stored data is an ordering error, not a full replace.
            if first >= state.index.value[0] && first <= state.index.last_ts {
                let keep = self.first_row_at_or_after(&state.index, first)?;
                self.truncate_locked(state, keep)?;
            }
        }

        let mut num_accepted_rows = 0;
        for (row, &ts) in time.iter().enumerate() {
            if ts < state.index.last_ts {
                if mode == AppendMode::SkipOverlap && num_accepted_rows == 0 {
                    continue;
                }
                let err = TagStoreError::OutOfOrder {
                    sub_table: self.id.id.clone(),
                    last_ts: state.index.last_ts,
                    timestamp: ts,
                    row,
                    mode,
                };
                self.restore_index(state);
                return Err(err);
            }
            state.index.push(ts, self.index_density);
            num_accepted_rows += 1;
        }
        if num_accepted_rows == 0 {
            return Ok(());
        }
        let row_skip = num_extra_rows - num_accepted_rows;

        if let Err(e) = meta::write_file(&self.lock_path, b"lock", self.sync) {
            self.restore_index(state);
            return Err(e.into());
        }

        let written = self.stored_columns.iter().try_for_each(|name| {
            let column = &self.columns[name];
            column.append(&columns[name][row_skip * column.row_size..], self.sync)
        });
        if let Err(e) = written {
            warn!("Append to {} failed, rolling back: {}", self.id.id, e);
            self.restore_index(state);
            if let Err(recovery) = self.recover(state) {
                error!("Rollback of {} failed: {}", self.id.id, recovery);
                return Err(TagStoreError::Fatal(format!(
                    "Append to {} failed ({}) and rollback failed ({})",
                    self.id.id, e, recovery
                )));
            }
            return Err(e);
        }

        // Once the meta is written the rows are in; a crash before the lock is
        // removed only triggers a no-op recovery.
        self.persist_index(state)?;
        self.remove_data_lock()?;
        debug!(
            "Appended {} rows to {} (skipped {}), {} rows total",
            num_accepted_rows, self.id.id, row_skip, state.index.num_rows
        );
        Ok(())
    }

    /// Check the column set and buffer sizes, returning the number of rows
    fn validate_append(&self, columns: &RawColumns) -> Result<usize> {
        for name in columns.keys() {
            if !self.stored_columns.contains(name) {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Column {} is not a stored column of sub table {}",
                    name, self.id.id
                )));
            }
        }
        if columns.len() != self.stored_columns.len() {
            return Err(TagStoreError::InvalidArgument(format!(
                "Must specify data for all non-tag columns: expected {:?}",
                self.stored_columns
            )));
        }

        let time_len = columns[&self.time_column].len();
        let time_row_size = self.columns[&self.time_column].row_size;
        if time_len % time_row_size != 0 {
            return Err(TagStoreError::InvalidArgument(format!(
                "Time column size {} is not a multiple of {}",
                time_len, time_row_size
            )));
        }
        let num_rows = time_len / time_row_size;
        for name in &self.stored_columns {
            let expected = self.columns[name].row_size * num_rows;
            let actual = columns[name].len();
            if actual != expected {
                return Err(TagStoreError::InvalidArgument(format!(
                    "Bad data size for column {}: expected {} bytes for {} rows, got {}",
                    name, expected, num_rows, actual
                )));
            }
        }
        Ok(num_rows)
    }

    /// Truncate to `num_rows`: persist the smaller index first, then shrink files
    ///
    /// `DATA.lock` is held from before the meta write until the files match it.
    fn truncate_locked(&self, state: &mut SubTableState, num_rows: usize) -> Result<()> {
        let current = state.index.num_rows;
        if num_rows > current {
            return Err(TagStoreError::InvalidArgument(format!(
                "Cannot truncate sub table {} with {} rows to {} rows",
                self.id.id, current, num_rows
            )));
        }
        if num_rows == current && !self.lock_path.exists() {
            return Ok(());
        }

        let last_ts = if num_rows == 0 {
            Timestamp::MIN
        } else {
            let last = self.columns[&self.time_column].read_span((num_rows - 1, num_rows))?;
            decode_timestamps(&last)?[0]
        };
        meta::write_file(&self.lock_path, b"lock", self.sync)?;
        state.index.truncate(num_rows, last_ts);
        self.persist_index(state)?;

        // From here on the table is truncated, even if shrinking the files fails.
        for name in &self.stored_columns {
            self.columns[name].resize(num_rows, self.sync)?;
        }
        self.remove_data_lock()?;
        info!(
            "Truncated sub table {} from {} to {} rows",
            self.id.id, current, num_rows
        );
        Ok(())
    }

    /// Shrink column files to the persisted row count and clear `DATA.lock`
    fn recover(&self, state: &SubTableState) -> Result<()> {
        warn!(
            "Recovering sub table {} to {} rows",
            self.id.id, state.durable.num_rows
        );
        for name in &self.stored_columns {
            self.columns[name].resize(state.durable.num_rows, self.sync)?;
        }
        self.remove_data_lock()
    }

    fn restore_index(&self, state: &mut SubTableState) {
        state.index = state.durable.clone();
    }

    fn persist_index(&self, state: &mut SubTableState) -> Result<()> {
        let stored = SubTableMeta {
            id: self.id.clone(),
            index: state.index.clone(),
        };
        meta::write_safe(&self.meta_path, &stored, self.sync)?;
        state.durable = stored.index;
        Ok(())
    }

    fn remove_data_lock(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("Failed to remove {:?}: {}", self.lock_path, e);
                Err(TagStoreError::Fatal(format!(
                    "Could not remove {:?}: {}",
                    self.lock_path, e
                )))
            }
        }
    }

    /// Position of the first row with time >= `ts`, or the row count
    fn first_row_at_or_after(&self, index: &Index, ts: Timestamp) -> Result<usize> {
        let (span, _) = self.query_time_span(index, &TimeSelector::from_start(ts), false)?;
        if span == EMPTY_SPAN {
            return Ok(index.num_rows);
        }
        Ok(span.0)
    }

    /// Resolve a time selector into an exact row span
    ///
    /// Returns the time column bytes of that span when `return_time_column` is set.
    fn query_time_span(
        &self,
        index: &Index,
        time_selector: &TimeSelector,
        return_time_column: bool,
    ) -> Result<(Span, Option<Bytes>)> {
        let time_meta = &self.columns[&self.time_column];
        let num_rows = index.num_rows;

        if let Some(last_n) = time_selector.last_n {
            let take = usize::try_from(last_n).unwrap_or(usize::MAX).min(num_rows);
            let span = (num_rows - take, num_rows);
            if take == 0 {
                return Ok((EMPTY_SPAN, None));
            }
            let time_data = if return_time_column {
                Some(time_meta.read_span(span)?)
            } else {
                None
            };
            return Ok((span, time_data));
        }

        let coarse = index.coarse_span(time_selector.start, time_selector.end);
        if coarse.0 >= coarse.1 {
            return Ok((EMPTY_SPAN, None));
        }
        let raw_coarse_time = time_meta.read_span(coarse)?;
        let coarse_time = decode_timestamps(&raw_coarse_time)?;

        let start = match time_selector.start {
            Some(start) => {
                let pos = if time_selector.include_start {
                    lower_bound(&coarse_time, start)
                } else {
                    upper_bound(&coarse_time, start)
                };
                if pos == coarse_time.len() {
                    return Ok((EMPTY_SPAN, None));
                }
                pos + coarse.0
            }
            None => 0,
        };
        let end = match time_selector.end {
            Some(end) => {
                let pos = if time_selector.include_end {
                    upper_bound(&coarse_time, end)
                } else {
                    lower_bound(&coarse_time, end)
                };
                pos + coarse.0
            }
            None => num_rows,
        };
        if end <= start {
            return Ok((EMPTY_SPAN, None));
        }

        let time_data = return_time_column.then(|| {
            let row_size = time_meta.row_size;
            raw_coarse_time.slice((start - coarse.0) * row_size..(end - coarse.0) * row_size)
        });
        Ok(((start, end), time_data))
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(TagStoreError::Fatal(format!(
                "Sub table {} is in an unrecoverable state after an earlier failure",
                self.id.id
            )));
        }
        Ok(())
    }

    fn poison_on_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(&result, Err(e) if e.is_fatal()) {
            error!("Sub table {} poisoned", self.id.id);
            self.poisoned.store(true, Ordering::Release);
        }
        result
    }
}
