//! Bulk loading of delimited files into destination tables.

use crate::error::TaskError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;
use uuid::Uuid;

/// A named connection to a destination warehouse.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Load every data row of `csv_path` into `table`.
    ///
    /// Returns the number of rows loaded.
    async fn load(&self, csv_path: &Path, table: &str) -> Result<u64, TaskError>;
}

/// Appends rows to `<dir>/<table>.csv`, one file per table.
///
/// The first record of every input is a header. A file's header is written
/// when its table file is created; later loads must have the same number of
/// columns. Rows are streamed into a staging file next to the table and only
/// reach the table once the whole input has been checked.
#[derive(Debug, Clone)]
pub struct TableDirLoader {
    dir: PathBuf,
    delimiter: char,
}

impl TableDirLoader {
    pub fn new(dir: impl Into<PathBuf>, delimiter: char) -> Self {
        Self {
            dir: dir.into(),
            delimiter,
        }
    }

    /// Path of the file backing `table`.
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", table))
    }

    /// Column count of an existing, non-empty table file.
    async fn existing_columns(&self, target: &Path) -> Result<Option<usize>, TaskError> {
        if !fs::try_exists(target).await.unwrap_or(false) {
            return Ok(None);
        }
        let file = File::open(target)
            .await
            .map_err(|e| TaskError::Load(format!("destination unavailable: {}", e)))?;
        let mut records = Records::new(BufReader::new(file), self.delimiter);
        Ok(records.next().await?.map(|header| header.fields))
    }
}

#[async_trait]
impl BulkLoader for TableDirLoader {
    async fn load(&self, csv_path: &Path, table: &str) -> Result<u64, TaskError> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(TaskError::Load(format!("invalid table name: {:?}", table)));
        }

        let source = File::open(csv_path)
            .await
            .map_err(|e| TaskError::Load(format!("cannot read {}: {}", csv_path.display(), e)))?;
        let mut records = Records::new(BufReader::new(source), self.delimiter);
        let header = records
            .next()
            .await?
            .ok_or_else(|| TaskError::Load(format!("{} has no header row", csv_path.display())))?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TaskError::Load(format!("destination unavailable: {}", e)))?;

        let target = self.table_path(table);
        let existing = self.existing_columns(&target).await?;
        if let Some(columns) = existing {
            if columns != header.fields {
                return Err(TaskError::Load(format!(
                    "table {} has {} columns, {} has {}",
                    table,
                    columns,
                    csv_path.display(),
                    header.fields
                )));
            }
        }

        let staging = self
            .dir
            .join(format!(".{}.{}.part", table, Uuid::new_v4().simple()));
        let staged = stage_rows(&mut records, &header, existing.is_none(), &staging).await;
        let committed = match staged {
            Ok(rows) if existing.is_none() => fs::rename(&staging, &target)
                .await
                .map(|_| rows)
                .map_err(|e| TaskError::Load(format!("write to {} failed: {}", table, e))),
            Ok(rows) => append_file(&staging, &target, table).await.map(|_| rows),
            Err(e) => Err(e),
        };
        let _ = fs::remove_file(&staging).await;

        let rows = committed?;
        debug!(table, rows, "rows loaded");
        Ok(rows)
    }
}

/// One logical record: possibly several physical lines when a quoted field
/// holds a newline.
struct Record {
    /// Physical line the record starts on, 1-based.
    line: usize,
    /// Raw bytes, newline-terminated.
    bytes: Vec<u8>,
    fields: usize,
}

struct Records<R> {
    reader: R,
    delimiter: char,
    line: usize,
}

impl<R: AsyncBufRead + Unpin> Records<R> {
    fn new(reader: R, delimiter: char) -> Self {
        Self {
            reader,
            delimiter,
            line: 0,
        }
    }

    /// The next non-blank record, or `None` at end of input.
    async fn next(&mut self) -> Result<Option<Record>, TaskError> {
        let mut bytes = Vec::new();
        let mut start = 0;

        loop {
            let read = self
                .reader
                .read_until(b'\n', &mut bytes)
                .await
                .map_err(|e| TaskError::Load(format!("read failed: {}", e)))?;
            if read == 0 && bytes.is_empty() {
                return Ok(None);
            }
            if read > 0 {
                self.line += 1;
                if start == 0 {
                    start = self.line;
                }
            }

            let body = trim_newline(&bytes);
            if read > 0 && body.is_empty() {
                bytes.clear();
                start = 0;
                continue;
            }

            let parsed = split_row(&String::from_utf8_lossy(body), self.delimiter);
            match parsed {
                Ok(fields) => {
                    if bytes.last() != Some(&b'\n') {
                        bytes.push(b'\n');
                    }
                    return Ok(Some(Record {
                        line: start,
                        bytes,
                        fields: fields.len(),
                    }));
                }
                // An open quote carries on to the next physical line.
                Err(_) if read > 0 => continue,
                Err(reason) => return Err(TaskError::Load(format!("line {}: {}", start, reason))),
            }
        }
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// Check every remaining record against the header and write them to
/// `staging`, preceded by the header when `with_header` is set.
async fn stage_rows<R: AsyncBufRead + Unpin>(
    records: &mut Records<R>,
    header: &Record,
    with_header: bool,
    staging: &Path,
) -> Result<u64, TaskError> {
    let write_err = |e: std::io::Error| TaskError::Load(format!("staging write failed: {}", e));
    let file = File::create(staging)
        .await
        .map_err(|e| TaskError::Load(format!("destination unavailable: {}", e)))?;
    let mut out = BufWriter::new(file);
    if with_header {
        out.write_all(&header.bytes).await.map_err(write_err)?;
    }

    let mut rows = 0u64;
    while let Some(record) = records.next().await? {
        if record.fields != header.fields {
            return Err(TaskError::Load(format!(
                "line {}: expected {} fields, found {}",
                record.line, header.fields, record.fields
            )));
        }
        out.write_all(&record.bytes).await.map_err(write_err)?;
        rows += 1;
    }
    out.flush().await.map_err(write_err)?;
    Ok(rows)
}

async fn append_file(staging: &Path, target: &Path, table: &str) -> Result<(), TaskError> {
    let write_err = |e: std::io::Error| TaskError::Load(format!("write to {} failed: {}", table, e));
    let mut source = File::open(staging).await.map_err(write_err)?;
    let mut dest = OpenOptions::new()
        .append(true)
        .open(target)
        .await
        .map_err(write_err)?;
    tokio::io::copy(&mut source, &mut dest)
        .await
        .map_err(write_err)?;
    dest.flush().await.map_err(write_err)
}

/// Split one delimited row, honouring double-quoted fields (`""` escapes a
/// quote inside a quoted field).
fn split_row(line: &str, delimiter: char) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
        } else if c == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(current);
    Ok(fields)
}
