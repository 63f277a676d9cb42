//! Decoded, typed records.

use serde::{Deserialize, Serialize};

use crate::decode::Format;
use crate::error::DecodeError;
use crate::schema::{DatasetSchema, ParamType};

/// One typed element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// HAPI isotime, kept exactly as sent by the server.
    Time(String),
    Double(#[serde(with = "float_repr")] f64),
    Integer(i32),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Integer(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Time(s) | Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn matches(&self, ty: ParamType) -> bool {
        matches!(
            (self, ty),
            (Value::Time(_), ParamType::IsoTime)
                | (Value::Double(_), ParamType::Double)
                | (Value::Integer(_), ParamType::Integer)
                | (Value::Text(_), ParamType::String)
        )
    }
}

/// Value of one parameter in one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Scalar(Value),
    /// Row-major elements of a fixed-shape array.
    Array { shape: Vec<usize>, values: Vec<Value> },
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            FieldValue::Array { .. } => None,
        }
    }

    /// Elements in row-major order; a scalar is a one-element slice.
    pub fn values(&self) -> &[Value] {
        match self {
            FieldValue::Scalar(v) => std::slice::from_ref(v),
            FieldValue::Array { values, .. } => values,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            FieldValue::Scalar(_) => &[],
            FieldValue::Array { shape, .. } => shape,
        }
    }
}

/// One time-aligned row: parameter name to value, in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    fields: Vec<(String, FieldValue)>,
}

impl DataRecord {
    pub fn new(fields: Vec<(String, FieldValue)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// The record's time tag (always the first field).
    pub fn time(&self) -> Option<&str> {
        self.fields
            .first()
            .and_then(|(_, v)| v.as_scalar())
            .and_then(Value::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks field names, element types and shapes against `schema`, which
    /// must list exactly the parameters this record carries.
    pub fn conforms_to(&self, schema: &DatasetSchema, index: usize) -> Result<(), DecodeError> {
        let shape_err = |name: &str, expected: &[usize]| DecodeError::Shape {
            record: index,
            name: name.to_string(),
            expected: expected.to_vec(),
        };

        if self.fields.len() != schema.parameters.len() {
            let name = schema.parameters.first().map(|p| p.name.as_str()).unwrap_or("");
            return Err(shape_err(name, &[]));
        }

        for ((name, value), param) in self.fields.iter().zip(&schema.parameters) {
            let shape_ok = match value {
                FieldValue::Scalar(_) => param.is_scalar(),
                FieldValue::Array { shape, values } => {
                    shape == &param.size && values.len() == param.element_count()
                }
            };
            let types_ok = value.values().iter().all(|v| v.matches(param.kind));
            if name != &param.name || !shape_ok || !types_ok {
                return Err(shape_err(&param.name, &param.size));
            }
        }
        Ok(())
    }
}

/// Result of a data request.
#[derive(Debug, Clone, PartialEq)]
pub struct HapiData {
    /// Projected schema: the time parameter followed by the selected
    /// parameters in dataset order.
    pub schema: DatasetSchema,
    pub records: Vec<DataRecord>,
    pub format: Format,
    /// True when every record came from the on-disk cache.
    pub from_cache: bool,
}

impl HapiData {
    /// One parameter's values across all records, or `None` if the
    /// parameter was not selected.
    pub fn column(&self, name: &str) -> Option<Vec<&FieldValue>> {
        self.schema.parameter(name)?;
        Some(self.records.iter().filter_map(|r| r.get(name)).collect())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// JSON has no literal for non-finite doubles; they are written as strings.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_f64(*v)
        } else if v.is_nan() {
            s.serialize_str("NaN")
        } else if *v > 0.0 {
            s.serialize_str("inf")
        } else {
            s.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid double {:?}",
                    other
                ))),
            },
        }
    }
}
