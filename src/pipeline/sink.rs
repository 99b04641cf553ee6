use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;

use crate::pipeline::handler::OutputRow;
use crate::utils::error::HandlerError;

/// Append-only CSV file. Each row goes out in a single `write_all` on a file
/// opened in append mode, so rows from concurrent writers never interleave.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn append(&self, row: &OutputRow) -> Result<(), HandlerError> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        writer.write_record(row.fields())?;
        let line = writer.into_inner().map_err(|e| self.sink_error(e.into_error()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.sink_error(e))?;
        file.write_all(&line).map_err(|e| self.sink_error(e))
    }

    fn sink_error(&self, source: std::io::Error) -> HandlerError {
        HandlerError::Sink {
            path: self.path.display().to_string(),
            source,
        }
    }
}
