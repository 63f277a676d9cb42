//! Wire-format decoders and encoders.
//!
//! Both decoders consume the byte stream forward-only and yield records
//! lazily. The column/byte projection of the requested parameters is a
//! [`RecordLayout`](crate::schema::RecordLayout) computed once before the first record is read.

mod binary;
mod csv;

pub use binary::{BinaryDecoder, encode_binary};
pub use csv::{CsvDecoder, encode_csv};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufReader, Read};
use std::str::FromStr;

use crate::error::DecodeError;
use crate::record::{DataRecord, FieldValue, Value};
use crate::schema::{DatasetSchema, FieldLayout, Selection};

/// HAPI data output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    Binary,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Binary => "binary",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Format::Csv),
            "binary" => Ok(Format::Binary),
            other => Err(format!("unsupported format {:?}", other)),
        }
    }
}

/// Lazy record stream over either wire format.
pub enum Records<R: Read> {
    Csv(CsvDecoder<BufReader<R>>),
    Binary(BinaryDecoder<R>),
}

impl<R: Read> Iterator for Records<R> {
    type Item = Result<DataRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Records::Csv(d) => d.next(),
            Records::Binary(d) => d.next(),
        }
    }
}

/// Decodes `input`, which carries the time parameter plus the parameters of
/// `selection`, in dataset order.
pub fn decode<R: Read>(
    format: Format,
    input: R,
    schema: &DatasetSchema,
    selection: &Selection,
) -> Records<R> {
    let layout = schema.layout(selection);
    match format {
        Format::Csv => Records::Csv(CsvDecoder::new(BufReader::new(input), layout)),
        Format::Binary => Records::Binary(BinaryDecoder::new(input, layout)),
    }
}

/// Shapes a field's elements into a scalar or a row-major array.
fn assemble(field: &FieldLayout, mut values: Vec<Value>) -> FieldValue {
    if field.shape.is_empty() {
        if let Some(v) = values.pop() {
            return FieldValue::Scalar(v);
        }
    }
    FieldValue::Array {
        shape: field.shape.clone(),
        values,
    }
}

/// Elements of `record` for `field`, checked against the layout.
fn field_elements<'r>(
    record: &'r DataRecord,
    field: &FieldLayout,
) -> std::io::Result<&'r [Value]> {
    let value = record.get(&field.name).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("record has no field {}", field.name),
        )
    })?;
    let values = value.values();
    if values.len() != field.elements || value.shape() != field.shape.as_slice() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("field {} does not match shape {:?}", field.name, field.shape),
        ));
    }
    Ok(values)
}
