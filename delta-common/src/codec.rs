//! Decoding of delivered snapshot files into records.

use serde_json::Value;
use thiserror::Error;

use crate::record::Record;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported snapshot format for {0}")]
    UnsupportedFormat(String),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

/// Format knobs that cannot be derived from the file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecOptions {
    /// Member of a top-level JSON object holding the record array.
    pub list_attribute: Option<String>,
    pub csv_delimiter: u8,
    pub csv_quote: u8,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            list_attribute: None,
            csv_delimiter: b',',
            csv_quote: b'"',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json { list_attribute: Option<String> },
    Csv { delimiter: u8, quote: u8 },
}

impl SnapshotFormat {
    /// Pick the format from the extension of `name`.
    pub fn for_name(name: &str, options: &CodecOptions) -> Result<Self, CodecError> {
        match extension(name).as_deref() {
            Some("json") => Ok(SnapshotFormat::Json {
                list_attribute: options.list_attribute.clone(),
            }),
            Some("csv") => Ok(SnapshotFormat::Csv {
                delimiter: options.csv_delimiter,
                quote: options.csv_quote,
            }),
            _ => Err(CodecError::UnsupportedFormat(name.to_owned())),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>, CodecError> {
        match self {
            SnapshotFormat::Json { list_attribute } => decode_json(bytes, list_attribute.as_deref()),
            SnapshotFormat::Csv { delimiter, quote } => decode_csv(bytes, *delimiter, *quote),
        }
    }
}

/// Content type used when a delivered file is copied elsewhere.
pub fn content_type(name: &str) -> &'static str {
    match extension(name).as_deref() {
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

fn extension(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
}

fn decode_json(bytes: &[u8], list_attribute: Option<&str>) -> Result<Vec<Record>, CodecError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let rows = match (value, list_attribute) {
        (Value::Array(rows), None) => rows,
        (Value::Object(mut object), Some(attribute)) => match object.shift_remove(attribute) {
            Some(Value::Array(rows)) => rows,
            Some(_) => {
                return Err(CodecError::Malformed(format!(
                    "'{attribute}' does not hold an array"
                )))
            }
            None => return Err(CodecError::Malformed(format!("no '{attribute}' member"))),
        },
        (_, None) => return Err(CodecError::Malformed("expected a top-level array".to_owned())),
        (_, Some(attribute)) => {
            return Err(CodecError::Malformed(format!(
                "expected a top-level object with a '{attribute}' member"
            )))
        }
    };

    rows.into_iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(record) => Ok(record),
            other => Err(CodecError::Malformed(format!(
                "row {i} is not an object: {other}"
            ))),
        })
        .collect()
}

fn decode_csv(bytes: &[u8], delimiter: u8, quote: u8) -> Result<Vec<Record>, CodecError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(quote)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| CodecError::Malformed(e.to_string()))?
        .clone();

    reader
        .records()
        .map(|row| {
            let row = row.map_err(|e| CodecError::Malformed(e.to_string()))?;
            Ok(headers
                .iter()
                .zip(row.iter())
                .map(|(name, value)| (name.to_owned(), Value::String(value.to_owned())))
                .collect())
        })
        .collect()
}
