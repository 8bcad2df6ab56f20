//! Column layout and flat column files

use crate::config::COLUMN_FILE_EXT;
use crate::meta::SyncPolicy;
use crate::{
    ColumnType, Result, Schema, Span, StrRef, SubTableId, TagStoreError, INVALID_STR_REF,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Where and how a column of one sub table is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Data file; `None` for tag columns, which are not stored
    pub path: Option<PathBuf>,
    pub column_type: ColumnType,
    /// Elements per row
    pub width: usize,
    pub type_size: usize,
    /// `type_size * width`
    pub row_size: usize,
    /// Constant value of a tag column
    pub tag_str_ref: StrRef,
}

impl ColumnMeta {
    /// A column backed by a data file
    pub fn stored(path: PathBuf, column_type: ColumnType, width: usize) -> Self {
        let type_size = column_type.size();
        Self {
            path: Some(path),
            column_type,
            width,
            type_size,
            row_size: type_size * width,
            tag_str_ref: INVALID_STR_REF,
        }
    }

    /// A tag column, synthesized from the sub table identity
    pub fn tag(str_ref: StrRef) -> Self {
        let type_size = ColumnType::StringRef.size();
        Self {
            path: None,
            column_type: ColumnType::StringRef,
            width: 1,
            type_size,
            row_size: type_size,
            tag_str_ref: str_ref,
        }
    }

    pub fn is_tag(&self) -> bool {
        self.path.is_none()
    }

    /// Read rows `span` (the bytes of rows `[span.0, span.1)`)
    pub fn read_span(&self, span: Span) -> Result<Bytes> {
        self.read_spans(&[span])
    }

    /// Read several row spans back to back into one buffer
    pub fn read_spans(&self, spans: &[Span]) -> Result<Bytes> {
        let num_rows: usize = spans.iter().map(|(start, end)| end - start).sum();
        let num_bytes = num_rows * self.row_size;

        let path = match &self.path {
            Some(path) => path,
            None => return self.synthesize_tag(num_rows),
        };

        let mut buffer = vec![0u8; num_bytes];
        let mut file = File::open(path)?;
        let mut buffer_pos = 0;
        for &(start, end) in spans {
            let to_read = (end - start) * self.row_size;
            file.seek(SeekFrom::Start((start * self.row_size) as u64))?;
            file.read_exact(&mut buffer[buffer_pos..buffer_pos + to_read])
                .map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => TagStoreError::Corruption(format!(
                        "Column file {:?} is shorter than rows {}..{}",
                        path, start, end
                    )),
                    _ => TagStoreError::Io(e),
                })?;
            buffer_pos += to_read;
        }
        Ok(Bytes::from(buffer))
    }

    fn synthesize_tag(&self, num_rows: usize) -> Result<Bytes> {
        if self.tag_str_ref == INVALID_STR_REF {
            return Err(TagStoreError::Corruption(
                "Columns without a path must be tag columns with a valid str_ref".into(),
            ));
        }
        let mut buf = BytesMut::with_capacity(num_rows * self.row_size);
        for _ in 0..num_rows {
            buf.put_u32_le(self.tag_str_ref);
        }
        Ok(buf.freeze())
    }

    /// Append raw rows to the end of the data file, creating it if needed
    pub fn append(&self, data: &[u8], sync: SyncPolicy) -> Result<()> {
        let Some(path) = &self.path else {
            return Err(TagStoreError::InvalidArgument(
                "Tag columns are not stored".into(),
            ));
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if !data.is_empty() {
            file.write_all(data)?;
            if sync.is_immediate() {
                file.sync_data()?;
            }
        }
        Ok(())
    }

    /// Shrink the data file to exactly `num_rows` rows
    ///
    /// Never extends: a file shorter than `num_rows` rows is corruption.
    pub fn resize(&self, num_rows: usize, sync: SyncPolicy) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let expected = (num_rows * self.row_size) as u64;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound && expected == 0 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(TagStoreError::Corruption(format!(
                "Column file {:?} has {} bytes, expected at least {}",
                path, actual, expected
            )));
        }
        if actual > expected {
            file.set_len(expected)?;
            if sync.is_immediate() {
                file.sync_all()?;
            }
        }
        Ok(())
    }

    /// Size of the data file in bytes, 0 for tag columns and missing files
    pub fn file_len(&self) -> Result<u64> {
        match &self.path {
            Some(path) => match std::fs::metadata(path) {
                Ok(m) => Ok(m.len()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
                Err(e) => Err(e.into()),
            },
            None => Ok(0),
        }
    }
}

/// `<dir>/<name>.bin`
pub fn column_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, COLUMN_FILE_EXT))
}

/// Resolve every schema column for the sub table stored in `dir`
pub fn resolve_columns(
    dir: &Path,
    schema: &Schema,
    id: &SubTableId,
) -> Result<HashMap<String, ColumnMeta>> {
    let mut columns = HashMap::new();
    for value_column in &schema.value_columns {
        columns.insert(
            value_column.name.clone(),
            ColumnMeta::stored(
                column_path(dir, &value_column.name),
                value_column.column_type,
                value_column.width,
            ),
        );
    }
    for tag_column in &schema.tag_columns {
        let str_ref = id.tags.get(tag_column).copied().ok_or_else(|| {
            TagStoreError::Corruption(format!(
                "Tag for column {} not found in sub table id {}",
                tag_column, id.id
            ))
        })?;
        columns.insert(tag_column.clone(), ColumnMeta::tag(str_ref));
    }
    columns.insert(
        schema.time_column.clone(),
        ColumnMeta::stored(
            column_path(dir, &schema.time_column),
            ColumnType::Int64,
            1,
        ),
    );
    Ok(columns)
}
