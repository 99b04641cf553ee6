//! Handler contract and the two stream handlers.
//!
//! Classification is total: every payload maps to exactly one label, with
//! `UNKNOWN` for anything unrecognised. The only way a handler fails is its
//! sink.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pipeline::sink::CsvSink;
use crate::utils::error::HandlerError;

pub const UNKNOWN: &str = "UNKNOWN";

/// Turns a delivered payload into an output row and persists it.
pub trait Handler: Send {
    fn handle(&mut self, payload: &[u8]) -> Result<OutputRow, HandlerError>;
}

impl<F> Handler for F
where
    F: FnMut(&[u8]) -> Result<OutputRow, HandlerError> + Send,
{
    fn handle(&mut self, payload: &[u8]) -> Result<OutputRow, HandlerError> {
        self(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A recognised value, normalised.
    Label(String),
    Unknown,
}

impl Classification {
    pub fn label(&self) -> &str {
        match self {
            Classification::Label(label) => label,
            Classification::Unknown => UNKNOWN,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One sink row: the payload as text and its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub original: String,
    pub classification: Classification,
}

impl OutputRow {
    pub fn fields(&self) -> [&str; 2] {
        [&self.original, self.classification.label()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Smoker,
    Region,
}

impl StreamKind {
    pub fn classify(self, value: &str) -> Classification {
        match self {
            StreamKind::Smoker => classify_smoker(value),
            StreamKind::Region => classify_region(value),
        }
    }

    /// Classifies a raw payload. Bytes that are not UTF-8 are replaced, which
    /// never matches a known value.
    pub fn transform(self, payload: &[u8]) -> OutputRow {
        let original: Cow<'_, str> = String::from_utf8_lossy(payload);
        let classification = match &original {
            Cow::Borrowed(text) => self.classify(text),
            Cow::Owned(_) => Classification::Unknown,
        };
        OutputRow {
            original: original.into_owned(),
            classification,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Smoker => f.write_str("smoker"),
            StreamKind::Region => f.write_str("region"),
        }
    }
}

fn classify_smoker(value: &str) -> Classification {
    let label = match value.to_ascii_lowercase().as_str() {
        "yes" => "TRUE",
        "no" => "FALSE",
        "smoker" => "NEW_SMOKER_COLUMN",
        _ => return Classification::Unknown,
    };
    Classification::Label(label.to_string())
}

fn classify_region(value: &str) -> Classification {
    match value.to_ascii_lowercase().as_str() {
        "southeast" | "southwest" | "northeast" | "northwest" => {
            Classification::Label(value.to_uppercase())
        }
        "region" => Classification::Label("NEW_REGION_COLUMN".to_string()),
        _ => Classification::Unknown,
    }
}

/// Classifies payloads of one stream and appends the rows to its sink.
#[derive(Debug)]
pub struct StreamHandler {
    kind: StreamKind,
    sink: CsvSink,
}

impl StreamHandler {
    pub fn new(kind: StreamKind, sink: CsvSink) -> Self {
        Self { kind, sink }
    }
}

impl Handler for StreamHandler {
    fn handle(&mut self, payload: &[u8]) -> Result<OutputRow, HandlerError> {
        let row = self.kind.transform(payload);
        self.sink.append(&row)?;
        Ok(row)
    }
}
