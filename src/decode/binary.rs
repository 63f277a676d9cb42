//! Fixed-width binary (HAPI binary) decoding.
//!
//! Records are framed purely by offset: every record is `layout.record_len`
//! bytes, fields sit at the offsets precomputed in the layout, numbers are
//! little-endian and text fields are NUL-padded to their declared length.
//! Padding is stripped on decode, so the encoder refuses strings ending in NUL
//! and times ending in whitespace, which would not survive the trip.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Read, Write};

use super::{assemble, field_elements};
use crate::error::DecodeError;
use crate::record::{DataRecord, Value};
use crate::schema::{ParamType, RecordLayout};

pub struct BinaryDecoder<R> {
    reader: R,
    layout: RecordLayout,
    buf: Vec<u8>,
    /// Bytes consumed by complete records.
    offset: u64,
    record: usize,
    done: bool,
}

impl<R: Read> BinaryDecoder<R> {
    pub fn new(reader: R, layout: RecordLayout) -> Self {
        let buf = vec![0u8; layout.record_len];
        Self {
            reader,
            layout,
            buf,
            offset: 0,
            record: 0,
            done: false,
        }
    }

    pub fn record_len(&self) -> usize {
        self.layout.record_len
    }

    pub fn records_read(&self) -> usize {
        self.record
    }

    fn next_record(&mut self) -> Result<Option<DataRecord>, DecodeError> {
        let len = self.layout.record_len;
        if len == 0 {
            return Ok(None);
        }

        let filled = fill(&mut self.reader, &mut self.buf).map_err(|source| DecodeError::Read {
            offset: self.offset,
            source,
        })?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < len {
            let actual_len = self.offset + filled as u64;
            return Err(DecodeError::Misaligned {
                record_len: len,
                actual_len,
                offset: (actual_len / len as u64) * len as u64,
            });
        }

        let record = decode_record(&self.layout, &self.buf, self.offset)?;
        self.offset += len as u64;
        self.record += 1;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for BinaryDecoder<R> {
    type Item = Result<DataRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn decode_record(
    layout: &RecordLayout,
    buf: &[u8],
    record_offset: u64,
) -> Result<DataRecord, DecodeError> {
    let mut out = Vec::with_capacity(layout.fields.len());
    for field in &layout.fields {
        let mut values = Vec::with_capacity(field.elements);
        for k in 0..field.elements {
            let start = field.offset + k * field.width;
            let bytes = &buf[start..start + field.width];
            let value = match field.kind {
                ParamType::Double => Value::Double(LittleEndian::read_f64(bytes)),
                ParamType::Integer => Value::Integer(LittleEndian::read_i32(bytes)),
                ParamType::IsoTime | ParamType::String => {
                    let text = std::str::from_utf8(trim_padding(bytes)).map_err(|_| {
                        DecodeError::InvalidUtf8 {
                            offset: record_offset + start as u64,
                            name: field.name.clone(),
                        }
                    })?;
                    if field.kind == ParamType::IsoTime {
                        Value::Time(text.trim_end().to_string())
                    } else {
                        Value::Text(text.to_string())
                    }
                }
            };
            values.push(value);
        }
        out.push((field.name.clone(), assemble(field, values)));
    }
    Ok(DataRecord::new(out))
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Writes records as HAPI binary.
pub fn encode_binary<W: Write>(
    records: &[DataRecord],
    layout: &RecordLayout,
    mut out: W,
) -> io::Result<()> {
    for record in records {
        for field in &layout.fields {
            for value in field_elements(record, field)? {
                match value {
                    Value::Double(v) => out.write_f64::<LittleEndian>(*v)?,
                    Value::Integer(v) => out.write_i32::<LittleEndian>(*v)?,
                    Value::Time(s) | Value::Text(s) => {
                        let lossy = s.ends_with('\0')
                            || (matches!(value, Value::Time(_)) && s.trim_end() != s);
                        if lossy {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                format!("{:?} in {} would lose its trailing padding", s, field.name),
                            ));
                        }
                        if s.len() > field.width {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                format!(
                                    "{:?} exceeds the {}-byte length of {}",
                                    s, field.width, field.name
                                ),
                            ));
                        }
                        out.write_all(s.as_bytes())?;
                        out.write_all(&vec![0u8; field.width - s.len()])?;
                    }
                }
            }
        }
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{dataset, sample_records};
    use crate::record::FieldValue;

    fn time_bytes(s: &str) -> Vec<u8> {
        let mut b = s.as_bytes().to_vec();
        b.resize(20, 0);
        b
    }

    #[test]
    fn decodes_selected_fields_by_offset() {
        let schema = dataset();
        let sel = schema.select(&["scalar", "vector"]).unwrap();
        let layout = schema.layout(&sel);
        assert_eq!(layout.record_len, 20 + 8 + 24);

        let mut bytes = time_bytes("1970-01-01T00:00:00Z");
        for v in [0.25f64, 1.0, 2.0, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let records: Vec<DataRecord> = BinaryDecoder::new(bytes.as_slice(), layout)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time(), Some("1970-01-01T00:00:00Z"));
        assert_eq!(
            records[0].get("scalar"),
            Some(&FieldValue::Scalar(Value::Double(0.25)))
        );
        assert_eq!(
            records[0].get("vector").unwrap().values(),
            &[Value::Double(1.0), Value::Double(2.0), Value::Double(3.0)]
        );
    }

    #[test]
    fn truncated_payload_reports_record_length_and_offset() {
        let schema = dataset();
        let all = schema.select::<&str>(&[]).unwrap();
        let layout = schema.layout(&all);
        let record_len = layout.record_len;

        let mut bytes = Vec::new();
        encode_binary(&sample_records(&schema), &layout, &mut bytes).unwrap();
        bytes.truncate(2 * record_len + 5);

        let mut dec = BinaryDecoder::new(bytes.as_slice(), layout);
        assert!(dec.next().unwrap().is_ok());
        assert!(dec.next().unwrap().is_ok());
        match dec.next().unwrap() {
            Err(DecodeError::Misaligned {
                record_len: expected,
                actual_len,
                offset,
            }) => {
                assert_eq!(expected, record_len);
                assert_eq!(actual_len, (2 * record_len + 5) as u64);
                assert_eq!(offset, (2 * record_len) as u64);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(dec.next().is_none());
    }

    #[test]
    fn short_single_record() {
        let schema = dataset();
        let sel = schema.select(&["scalarint"]).unwrap();
        let layout = schema.layout(&sel);
        let bytes = vec![0u8; layout.record_len - 1];
        let err = BinaryDecoder::new(bytes.as_slice(), layout)
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Misaligned {
                record_len: 24,
                actual_len: 23,
                offset: 0
            }
        ));
    }

    #[test]
    fn empty_payload_yields_nothing() {
        let schema = dataset();
        let all = schema.select::<&str>(&[]).unwrap();
        let mut dec = BinaryDecoder::new(&[][..], schema.layout(&all));
        assert!(dec.next().is_none());
    }

    #[test]
    fn invalid_text_reports_offset() {
        let schema = dataset();
        let sel = schema.select(&["scalarstr"]).unwrap();
        let layout = schema.layout(&sel);
        let mut bytes = time_bytes("1970-01-01T00:00:00Z");
        bytes.extend_from_slice(&[0xff, 0xfe, 0, 0, 0, 0]);
        let err = BinaryDecoder::new(bytes.as_slice(), layout)
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8 { offset: 20, .. }));
    }

    #[test]
    fn oversized_text_is_rejected_on_encode() {
        let schema = dataset();
        let sel = schema.select(&["scalarstr"]).unwrap();
        let layout = schema.layout(&sel);
        let record = DataRecord::new(vec![
            (
                "Time".to_string(),
                FieldValue::Scalar(Value::Time("1970-01-01T00:00:00Z".to_string())),
            ),
            (
                "scalarstr".to_string(),
                FieldValue::Scalar(Value::Text("too long".to_string())),
            ),
        ]);
        let mut out = Vec::new();
        assert!(encode_binary(&[record], &layout, &mut out).is_err());
    }
}
