//! Delimited-text (HAPI CSV) decoding.

use std::io::{self, BufRead, Write};

use super::{assemble, field_elements};
use crate::error::DecodeError;
use crate::record::{DataRecord, Value};
use crate::schema::{ParamType, RecordLayout};

pub const DEFAULT_DELIMITER: char = ',';

/// Line-oriented decoder. Blank lines and `#` header lines are skipped and
/// are not counted; line numbers in errors count data lines from 1.
pub struct CsvDecoder<R> {
    reader: R,
    layout: RecordLayout,
    delimiter: char,
    buf: String,
    bytes: u64,
    line: usize,
    done: bool,
}

impl<R: BufRead> CsvDecoder<R> {
    pub fn new(reader: R, layout: RecordLayout) -> Self {
        Self {
            reader,
            layout,
            delimiter: DEFAULT_DELIMITER,
            buf: String::new(),
            bytes: 0,
            line: 0,
            done: false,
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Data lines consumed so far.
    pub fn lines_read(&self) -> usize {
        self.line
    }

    /// Appends one physical line to `buf`; returns the bytes read.
    fn append_line(&mut self) -> Result<usize, DecodeError> {
        let n = match self.reader.read_line(&mut self.buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(DecodeError::Text {
                    line: self.line + 1,
                    reason: "line is not valid UTF-8".to_string(),
                });
            }
            Err(source) => {
                return Err(DecodeError::Read {
                    offset: self.bytes,
                    source,
                });
            }
        };
        self.bytes += n as u64;
        Ok(n)
    }

    fn next_record(&mut self) -> Result<Option<DataRecord>, DecodeError> {
        loop {
            self.buf.clear();
            if self.append_line()? == 0 {
                return Ok(None);
            }
            {
                let text = self.buf.trim_end_matches(['\r', '\n']);
                if text.trim().is_empty() || text.starts_with('#') {
                    continue;
                }
            }
            self.line += 1;

            // A quoted field may span physical lines.
            while quote_open(&self.buf) {
                if self.append_line()? == 0 {
                    break;
                }
            }

            let text = self.buf.trim_end_matches(['\r', '\n']);
            let fields = split_fields(text, self.delimiter).map_err(|reason| {
                DecodeError::Text {
                    line: self.line,
                    reason,
                }
            })?;
            if fields.len() != self.layout.columns {
                return Err(DecodeError::FieldCount {
                    line: self.line,
                    expected: self.layout.columns,
                    found: fields.len(),
                });
            }
            return build_record(&self.layout, &fields, self.line).map(Some);
        }
    }
}

impl<R: BufRead> Iterator for CsvDecoder<R> {
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

fn build_record(
    layout: &RecordLayout,
    fields: &[String],
    line: usize,
) -> Result<DataRecord, DecodeError> {
    let mut out = Vec::with_capacity(layout.fields.len());
    for field in &layout.fields {
        let mut values = Vec::with_capacity(field.elements);
        let columns = &fields[field.column..field.column + field.elements];
        for (k, raw) in columns.iter().enumerate() {
            let value = parse_value(field.kind, raw).ok_or_else(|| DecodeError::Parse {
                line,
                column: field.column + k + 1,
                value: raw.clone(),
                kind: field.kind.name(),
            })?;
            values.push(value);
        }
        out.push((field.name.clone(), assemble(field, values)));
    }
    Ok(DataRecord::new(out))
}

fn parse_value(kind: ParamType, raw: &str) -> Option<Value> {
    match kind {
        ParamType::Double => raw.parse().ok().map(Value::Double),
        ParamType::Integer => raw.parse().ok().map(Value::Integer),
        ParamType::IsoTime if raw.is_empty() => None,
        ParamType::IsoTime => Some(Value::Time(raw.to_string())),
        ParamType::String => Some(Value::Text(raw.to_string())),
    }
}

/// Splits one line. Unquoted fields are trimmed; a field may be wrapped in
/// double quotes, inside which `""` is a literal quote and the delimiter
/// has no special meaning.
fn split_fields(line: &str, delimiter: char) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == delimiter {
            fields.push(finish_field(&mut field, quoted));
            quoted = false;
        } else if quoted {
            if !c.is_whitespace() {
                return Err(format!(
                    "unexpected {:?} after closing quote in field {}",
                    c,
                    fields.len() + 1
                ));
            }
        } else if c == '"' && field.trim().is_empty() {
            field.clear();
            in_quotes = true;
            quoted = true;
        } else {
            field.push(c);
        }
    }

    if in_quotes {
        return Err(format!("unterminated quote in field {}", fields.len() + 1));
    }
    fields.push(finish_field(&mut field, quoted));
    Ok(fields)
}

// Every quote toggles, so an escaped `""` leaves the state unchanged.
fn quote_open(text: &str) -> bool {
    text.chars().filter(|&c| c == '"').count() % 2 == 1
}

fn finish_field(field: &mut String, quoted: bool) -> String {
    let out = if quoted {
        field.clone()
    } else {
        field.trim().to_string()
    };
    field.clear();
    out
}

/// Writes records as HAPI CSV, one line per record.
pub fn encode_csv<W: Write>(
    records: &[DataRecord],
    layout: &RecordLayout,
    mut out: W,
) -> io::Result<()> {
    let mut line = String::new();
    for record in records {
        line.clear();
        for field in &layout.fields {
            for value in field_elements(record, field)? {
                if !line.is_empty() {
                    line.push(DEFAULT_DELIMITER);
                }
                push_value(&mut line, value);
            }
        }
        line.push('\n');
        out.write_all(line.as_bytes())?;
    }
    out.flush()
}

fn push_value(line: &mut String, value: &Value) {
    match value {
        Value::Double(v) => line.push_str(&format!("{:?}", v)),
        Value::Integer(v) => line.push_str(&v.to_string()),
        Value::Time(s) | Value::Text(s) => push_text(line, s),
    }
}

fn push_text(line: &mut String, s: &str) {
    let needs_quotes = s.is_empty()
        || s.trim() != s
        || s.starts_with('#')
        || s.contains([DEFAULT_DELIMITER, '"', '\n', '\r']);
    if needs_quotes {
        line.push('"');
        line.push_str(&s.replace('"', "\"\""));
        line.push('"');
    } else {
        line.push_str(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::dataset;
    use crate::record::FieldValue;

    fn decoder<'a>(text: &'a str, names: &[&str]) -> CsvDecoder<&'a [u8]> {
        let schema = dataset();
        let sel = schema.select(names).unwrap();
        CsvDecoder::new(text.as_bytes(), schema.layout(&sel))
    }

    #[test]
    fn scalar_only_selection() {
        let text = "1970-01-01T00:00:00Z,0.0\n1970-01-01T00:00:01Z,1.5\n";
        let records: Vec<DataRecord> = decoder(text, &["scalar"])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].len(), 2);
        assert_eq!(
            records[1].get("scalar"),
            Some(&FieldValue::Scalar(Value::Double(1.5)))
        );
        assert!(records[1].get("vector").is_none());
    }

    #[test]
    fn vector_columns_fill_the_shape_in_order() {
        let text = "1970-01-01T00:00:00Z, 2.0 ,1,2,3\n";
        let records: Vec<DataRecord> = decoder(text, &["scalar", "vector"])
            .collect::<Result<_, _>>()
            .unwrap();
        let vector = records[0].get("vector").unwrap();
        assert_eq!(vector.shape(), &[3]);
        assert_eq!(
            vector.values(),
            &[Value::Double(1.0), Value::Double(2.0), Value::Double(3.0)]
        );
        assert_eq!(records[0].names().collect::<Vec<_>>(), vec!["Time", "scalar", "vector"]);
    }

    #[test]
    fn matrix_is_row_major() {
        let text = "1970-01-01T00:00:00Z,1,2,3,4\n";
        let records: Vec<DataRecord> = decoder(text, &["matrix"])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            records[0].get("matrix"),
            Some(&FieldValue::Array {
                shape: vec![2, 2],
                values: vec![
                    Value::Integer(1),
                    Value::Integer(2),
                    Value::Integer(3),
                    Value::Integer(4)
                ],
            })
        );
    }

    #[test]
    fn field_count_error_names_data_line() {
        let text = "\n# header\n1970-01-01T00:00:00Z,1.0\n\n   \n1970-01-01T00:00:01Z,1.0,9\n";
        let mut dec = decoder(text, &["scalar"]);
        assert!(dec.next().unwrap().is_ok());
        match dec.next().unwrap() {
            Err(DecodeError::FieldCount {
                line,
                expected,
                found,
            }) => {
                assert_eq!((line, expected, found), (2, 2, 3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(dec.next().is_none());
    }

    #[test]
    fn numeric_parse_failure() {
        let text = "1970-01-01T00:00:00Z,1.0\n1970-01-01T00:00:01Z,abc\n";
        let err = decoder(text, &["scalar"])
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        match err {
            DecodeError::Parse {
                line,
                column,
                value,
                kind,
            } => {
                assert_eq!((line, column, value.as_str(), kind), (2, 2, "abc", "double"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let text = "1970-01-01T00:00:00Z,1.5\n";
        assert!(matches!(
            decoder(text, &["scalarint"]).next().unwrap(),
            Err(DecodeError::Parse { kind: "integer", .. })
        ));
    }

    #[test]
    fn quoted_strings() {
        assert_eq!(
            split_fields(r#"a, "b,c" ,"d""e",f "#, ',').unwrap(),
            vec!["a", "b,c", "d\"e", "f"]
        );
        assert_eq!(split_fields("a,,b", ',').unwrap(), vec!["a", "", "b"]);
        assert!(split_fields(r#"a,"b"#, ',').is_err());
        assert!(split_fields(r#""a"x,b"#, ',').is_err());
    }

    #[test]
    fn quoted_field_may_span_lines() {
        let text = "1970-01-01T00:00:00Z,\"one\r\n\ntwo\"\n1970-01-01T00:00:01Z,\"x\"\n1970-01-01T00:00:02Z\n";
        let mut dec = decoder(text, &["scalarstr"]);
        let first = dec.next().unwrap().unwrap();
        assert_eq!(
            first.get("scalarstr").unwrap().values(),
            &[Value::Text("one\r\n\ntwo".to_string())]
        );
        assert!(dec.next().unwrap().is_ok());
        assert!(matches!(
            dec.next().unwrap(),
            Err(DecodeError::FieldCount { line: 3, .. })
        ));

        let text = "1970-01-01T00:00:00Z,\"never closed\nstill open\n";
        assert!(matches!(
            decoder(text, &["scalarstr"]).next().unwrap(),
            Err(DecodeError::Text { line: 1, .. })
        ));
    }

    #[test]
    fn custom_delimiter() {
        let text = "1970-01-01T00:00:00Z;2.5\n";
        let record = decoder(text, &["scalar"])
            .with_delimiter(';')
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.get("scalar").unwrap().values(), &[Value::Double(2.5)]);
    }

    #[test]
    fn crlf_and_nan() {
        let text = "1970-01-01T00:00:00Z,NaN\r\n";
        let record = decoder(text, &["scalar"]).next().unwrap().unwrap();
        assert!(record.get("scalar").unwrap().values()[0].as_f64().unwrap().is_nan());
    }
}
