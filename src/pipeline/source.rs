//! Record sources
//!
//! A `RecordSource` yields a lazy, finite sequence of records whose fields are
//! addressed by column index. Opening the source again restarts it from the
//! first record.

use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};

use crate::utils::error::SourceError;

/// One input record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub fields: Vec<String>,
    /// 1-based line number in the source, when known.
    pub line: Option<u64>,
}

impl Record {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            line: None,
        }
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }
}

impl From<StringRecord> for Record {
    fn from(record: StringRecord) -> Self {
        Self {
            line: record.position().map(|p| p.line()),
            fields: record.iter().map(str::to_string).collect(),
        }
    }
}

pub type Records<'a> = Box<dyn Iterator<Item = Result<Record, SourceError>> + Send + 'a>;

pub trait RecordSource {
    /// Starts a fresh pass over the records.
    fn records(&self) -> Result<Records<'_>, SourceError>;
}

/// Records held in memory.
impl RecordSource for Vec<Record> {
    fn records(&self) -> Result<Records<'_>, SourceError> {
        Ok(Box::new(self.iter().cloned().map(Ok::<Record, SourceError>)))
    }
}

/// A CSV file. By default every row, including a header row, is a record.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    has_headers: bool,
}

impl CsvSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            has_headers: false,
        }
    }

    /// Skips the first row when `has_headers` is set.
    pub fn has_headers(mut self, has_headers: bool) -> Self {
        self.has_headers = has_headers;
        self
    }
}

impl RecordSource for CsvSource {
    fn records(&self) -> Result<Records<'_>, SourceError> {
        let reader = ReaderBuilder::new()
            .has_headers(self.has_headers)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|source| SourceError::Open {
                path: self.path.display().to_string(),
                source,
            })?;

        Ok(Box::new(
            reader
                .into_records()
                .map(|row| row.map(Record::from).map_err(SourceError::from)),
        ))
    }
}
