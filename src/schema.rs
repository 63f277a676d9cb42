//! Dataset schemas resolved from HAPI `info` documents.
//!
//! [`resolve`] is the only place where the loosely typed JSON metadata is
//! interpreted. Everything downstream works on the closed [`DatasetSchema`]
//! and on a [`RecordLayout`] derived once per request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::SchemaError;
use crate::record::Value;
use crate::time::{parse_hapi_time, parse_iso_duration};

/// Byte width assumed for an isotime parameter that declares no `length`
/// (`YYYY-MM-DDTHH:MM:SS.sssZ`).
pub const DEFAULT_ISOTIME_LENGTH: usize = 24;

/// Upper bound on the bytes one binary record may occupy.
pub const MAX_RECORD_BYTES: usize = 1 << 26;

/// Element type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    IsoTime,
    Double,
    Integer,
    String,
}

impl ParamType {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "isotime" | "time" => Some(ParamType::IsoTime),
            "double" => Some(ParamType::Double),
            "integer" => Some(ParamType::Integer),
            "string" => Some(ParamType::String),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamType::IsoTime => "isotime",
            ParamType::Double => "double",
            ParamType::Integer => "integer",
            ParamType::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    /// Array shape; empty for scalars.
    pub size: Vec<usize>,
    /// Byte width of one element for `isotime` and `string` parameters.
    pub length: Option<usize>,
    pub fill: Option<Value>,
    pub units: Option<String>,
    pub description: Option<String>,
}

impl ParameterSchema {
    pub fn is_scalar(&self) -> bool {
        self.size.is_empty()
    }

    /// Number of elements (columns in CSV) the parameter occupies.
    pub fn element_count(&self) -> usize {
        self.size.iter().fold(1, |n, &d| n.saturating_mul(d))
    }

    /// Bytes the parameter occupies in a binary record, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.size
            .iter()
            .try_fold(self.element_width(), |n, &d| n.checked_mul(d))
    }

    /// Binary width of one element. All HAPI binary numbers are little-endian:
    /// doubles are IEEE 754 binary64, integers signed 32-bit.
    pub fn element_width(&self) -> usize {
        match self.kind {
            ParamType::Double => 8,
            ParamType::Integer => 4,
            ParamType::IsoTime | ParamType::String => {
                self.length.unwrap_or(DEFAULT_ISOTIME_LENGTH)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub id: String,
    pub hapi_version: Option<String>,
    /// On-wire column order; the first entry is the time parameter.
    pub parameters: Vec<ParameterSchema>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub max_request_duration: Option<Duration>,
    pub cadence: Option<String>,
    pub description: Option<String>,
}

impl DatasetSchema {
    pub fn time_parameter(&self) -> &ParameterSchema {
        &self.parameters[0]
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSchema> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// True for HAPI 3 and later, which renamed the data query parameters.
    pub fn uses_v3_queries(&self) -> bool {
        self.hapi_version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.parse::<u32>().ok())
            .is_some_and(|major| major >= 3)
    }

    /// Validates requested parameter names and orders them as the dataset
    /// does. Blank names are ignored; no names at all selects everything.
    pub fn select<S: AsRef<str>>(&self, requested: &[S]) -> Result<Selection, SchemaError> {
        let mut wanted: HashSet<&str> = HashSet::new();
        for name in requested {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            if self.parameter(name).is_none() {
                return Err(SchemaError::UnknownParameter {
                    dataset: self.id.clone(),
                    name: name.to_string(),
                });
            }
            wanted.insert(name);
        }

        let all = wanted.is_empty()
            || self.parameters[1..]
                .iter()
                .all(|p| wanted.contains(p.name.as_str()));
        let names = self
            .parameters
            .iter()
            .enumerate()
            .filter(|(i, p)| *i == 0 || all || wanted.contains(p.name.as_str()))
            .map(|(_, p)| p.name.clone())
            .collect();

        Ok(Selection { names, all })
    }

    /// Schema restricted to the selected parameters.
    pub fn project(&self, selection: &Selection) -> DatasetSchema {
        DatasetSchema {
            parameters: self
                .parameters
                .iter()
                .filter(|p| selection.contains(&p.name))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    pub fn layout(&self, selection: &Selection) -> RecordLayout {
        RecordLayout::from_parameters(
            self.parameters
                .iter()
                .filter(|p| selection.contains(&p.name)),
        )
    }
}

/// Validated parameter selection in dataset order, time parameter first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    names: Vec<String>,
    all: bool,
}

impl Selection {
    /// Splits a HAPI comma-separated parameter list.
    pub fn split_list(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    /// Value for the `parameters` query field, `None` when everything is
    /// selected. The time parameter is implied and only sent when it is the
    /// sole selection.
    pub fn query_value(&self) -> Option<String> {
        if self.all {
            return None;
        }
        match self.names.split_first() {
            Some((time, [])) => Some(time.clone()),
            Some((_, rest)) => Some(rest.join(",")),
            None => None,
        }
    }
}

/// Where one parameter lives in a CSV line and in a binary record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    pub kind: ParamType,
    pub shape: Vec<usize>,
    pub elements: usize,
    /// First CSV column.
    pub column: usize,
    /// Byte offset within a binary record.
    pub offset: usize,
    /// Byte width of one element.
    pub width: usize,
}

/// Column and byte projection of a selection, computed once per request.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLayout {
    pub fields: Vec<FieldLayout>,
    /// CSV columns per line.
    pub columns: usize,
    /// Bytes per binary record.
    pub record_len: usize,
}

impl RecordLayout {
    /// Layout of every parameter of `schema`, in order.
    pub fn for_schema(schema: &DatasetSchema) -> Self {
        Self::from_parameters(schema.parameters.iter())
    }

    fn from_parameters<'a>(params: impl Iterator<Item = &'a ParameterSchema>) -> Self {
        let mut fields = Vec::new();
        let mut column = 0;
        let mut offset = 0;
        for p in params {
            let elements = p.element_count();
            let width = p.element_width();
            fields.push(FieldLayout {
                name: p.name.clone(),
                kind: p.kind,
                shape: p.size.clone(),
                elements,
                column,
                offset,
                width,
            });
            column = column.saturating_add(elements);
            offset = offset.saturating_add(elements.saturating_mul(width));
        }
        Self {
            fields,
            columns: column,
            record_len: offset,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInfo {
    #[serde(default, rename = "HAPI")]
    hapi: Option<String>,
    #[serde(default)]
    parameters: Vec<RawParameter>,
    start_date: String,
    stop_date: String,
    #[serde(default)]
    max_request_duration: Option<String>,
    #[serde(default)]
    cadence: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<Vec<i64>>,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    fill: Option<serde_json::Value>,
    #[serde(default)]
    units: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

/// Turns a raw `info` document into a validated schema.
pub fn resolve(dataset: &str, raw: &serde_json::Value) -> Result<DatasetSchema, SchemaError> {
    let info = RawInfo::deserialize(raw).map_err(|e| SchemaError::Malformed {
        context: dataset.to_string(),
        reason: e.to_string(),
    })?;

    if info.parameters.is_empty() {
        return Err(SchemaError::NoParameters {
            dataset: dataset.to_string(),
        });
    }

    let mut seen = HashSet::new();
    let mut record_bytes = 0usize;
    let mut parameters = Vec::with_capacity(info.parameters.len());
    for (i, raw) in info.parameters.into_iter().enumerate() {
        let param = resolve_parameter(raw)?;
        if i == 0 && param.kind != ParamType::IsoTime {
            return Err(SchemaError::TimeNotFirst {
                dataset: dataset.to_string(),
                name: param.name,
            });
        }
        if !seen.insert(param.name.clone()) {
            return Err(SchemaError::DuplicateParameter { name: param.name });
        }
        record_bytes = record_bytes.saturating_add(param.byte_len().unwrap_or(usize::MAX));
        if record_bytes > MAX_RECORD_BYTES {
            return Err(SchemaError::InvalidSize {
                name: param.name,
                size: param.size.iter().map(|&d| d as i64).collect(),
                reason: "record would exceed the maximum binary record length".to_string(),
            });
        }
        parameters.push(param);
    }

    if !parameters[0].is_scalar() {
        let time = &parameters[0];
        return Err(SchemaError::TimeNotScalar {
            name: time.name.clone(),
            size: time.size.iter().map(|&d| d as i64).collect(),
        });
    }

    let max_request_duration = info
        .max_request_duration
        .as_deref()
        .map(parse_iso_duration)
        .transpose()?;

    Ok(DatasetSchema {
        id: dataset.to_string(),
        hapi_version: info.hapi,
        parameters,
        start: parse_hapi_time(&info.start_date)?,
        stop: parse_hapi_time(&info.stop_date)?,
        max_request_duration,
        cadence: info.cadence,
        description: info.description,
    })
}

fn resolve_parameter(raw: RawParameter) -> Result<ParameterSchema, SchemaError> {
    let kind = ParamType::from_name(&raw.kind).ok_or_else(|| SchemaError::UnknownType {
        name: raw.name.clone(),
        kind: raw.kind.clone(),
    })?;

    let raw_size = raw.size.unwrap_or_default();
    let invalid_size = |reason: &str| SchemaError::InvalidSize {
        name: raw.name.clone(),
        size: raw_size.clone(),
        reason: reason.to_string(),
    };
    if raw_size.iter().any(|&d| d <= 0) {
        return Err(invalid_size("every dimension must be positive"));
    }
    let size: Vec<usize> = raw_size
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<_, _>>()
        .map_err(|_| invalid_size("dimension too large"))?;

    let length = match (kind, raw.length) {
        (ParamType::IsoTime | ParamType::String, Some(n)) if n > 0 => Some(n as usize),
        (ParamType::IsoTime, None) => Some(DEFAULT_ISOTIME_LENGTH),
        (ParamType::IsoTime | ParamType::String, _) => {
            return Err(SchemaError::MissingLength {
                name: raw.name,
                kind: kind.name().to_string(),
            });
        }
        (_, _) => None,
    };

    let fill = match raw.fill {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(parse_fill(&raw.name, kind, &v)?),
    };

    let units = match raw.units {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Array(items)) => Some(
            items
                .iter()
                .map(|u| u.as_str().map(str::to_string).unwrap_or_else(|| u.to_string()))
                .collect::<Vec<_>>()
                .join(", "),
        ),
        _ => None,
    };

    let param = ParameterSchema {
        name: raw.name,
        kind,
        size,
        length,
        fill,
        units,
        description: raw.description,
    };
    match param.byte_len() {
        Some(n) if n <= MAX_RECORD_BYTES => Ok(param),
        _ => Err(SchemaError::InvalidSize {
            name: param.name,
            size: raw_size,
            reason: "record would exceed the maximum binary record length".to_string(),
        }),
    }
}

fn parse_fill(name: &str, kind: ParamType, v: &serde_json::Value) -> Result<Value, SchemaError> {
    let invalid = || SchemaError::InvalidFill {
        name: name.to_string(),
        fill: v.to_string(),
    };
    match (kind, v) {
        (ParamType::Double, serde_json::Value::String(s)) => {
            s.trim().parse().map(Value::Double).map_err(|_| invalid())
        }
        (ParamType::Double, serde_json::Value::Number(n)) => {
            n.as_f64().map(Value::Double).ok_or_else(invalid)
        }
        (ParamType::Integer, serde_json::Value::String(s)) => {
            s.trim().parse().map(Value::Integer).map_err(|_| invalid())
        }
        (ParamType::Integer, serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Integer)
            .ok_or_else(invalid),
        (ParamType::IsoTime, serde_json::Value::String(s)) => Ok(Value::Time(s.clone())),
        (ParamType::String, serde_json::Value::String(s)) => Ok(Value::Text(s.clone())),
        _ => Err(invalid()),
    }
}
