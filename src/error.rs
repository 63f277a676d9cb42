//! Error taxonomy for HAPI requests.
//!
//! Every failure a caller can observe is one of the five [`Error`] variants.
//! Bad server addresses, bad dataset/parameter names, transport problems,
//! malformed payloads and local storage faults stay distinguishable so callers
//! can branch on them.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// HAPI status code for a successful request.
pub const HAPI_OK: i64 = 1200;
/// HAPI status code for an unknown dataset id.
pub const HAPI_UNKNOWN_DATASET: i64 = 1406;
/// HAPI status code for an unknown dataset parameter.
pub const HAPI_UNKNOWN_PARAMETER: i64 = 1407;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error returned by every public operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid server address {url}: {reason}")]
    Address { url: String, reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl Error {
    pub(crate) fn address(url: &str, reason: impl Into<String>) -> Self {
        Error::Address {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// Metadata violates the schema invariants, or the caller named something the
/// server does not have.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("dataset {dataset} has no parameters")]
    NoParameters { dataset: String },

    #[error("first parameter {name} of dataset {dataset} must be the isotime parameter")]
    TimeNotFirst { dataset: String, name: String },

    #[error("time parameter {name} must be scalar, got size {size:?}")]
    TimeNotScalar { name: String, size: Vec<i64> },

    #[error("parameter {name} has invalid size {size:?}: {reason}")]
    InvalidSize {
        name: String,
        size: Vec<i64>,
        reason: String,
    },

    #[error("parameter name {name} appears more than once")]
    DuplicateParameter { name: String },

    #[error("parameter {name} of type {kind} requires a positive length")]
    MissingLength { name: String, kind: String },

    #[error("parameter {name} has unsupported type {kind}")]
    UnknownType { name: String, kind: String },

    #[error("parameter {name} has invalid fill value {fill}")]
    InvalidFill { name: String, fill: String },

    #[error("unknown dataset {dataset}: {message}")]
    UnknownDataset { dataset: String, message: String },

    #[error("unknown parameter {name} in dataset {dataset}")]
    UnknownParameter { dataset: String, name: String },

    #[error("invalid time {value}: {reason}")]
    InvalidTime { value: String, reason: String },

    #[error("start {start} is not before stop {stop}")]
    EmptyTimeRange { start: String, stop: String },

    #[error("invalid duration {value}")]
    InvalidDuration { value: String },

    #[error("malformed metadata for {context}: {reason}")]
    Malformed { context: String, reason: String },
}

/// Why a network exchange failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchErrorKind {
    Timeout,
    Cancelled,
    Transport(String),
    /// Non-success answer. `code` and `message` come verbatim from the server's
    /// status document when it sent one.
    Status {
        http_status: u16,
        code: Option<i64>,
        message: String,
    },
    InvalidBody(String),
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Timeout => write!(f, "request timed out"),
            FetchErrorKind::Cancelled => write!(f, "request cancelled"),
            FetchErrorKind::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchErrorKind::Status {
                http_status,
                code: Some(code),
                message,
            } => write!(f, "HTTP {} (HAPI {}): {}", http_status, code, message),
            FetchErrorKind::Status {
                http_status,
                code: None,
                message,
            } => write!(f, "HTTP {}: {}", http_status, message),
            FetchErrorKind::InvalidBody(msg) => write!(f, "invalid response body: {}", msg),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("request to {url} failed: {kind}")]
pub struct FetchError {
    pub url: String,
    pub kind: FetchErrorKind,
}

impl FetchError {
    pub(crate) fn new(url: &str, kind: FetchErrorKind) -> Self {
        Self {
            url: url.to_string(),
            kind,
        }
    }

    /// HTTP status of a non-success answer, if that is what failed.
    pub fn http_status(&self) -> Option<u16> {
        match &self.kind {
            FetchErrorKind::Status { http_status, .. } => Some(*http_status),
            _ => None,
        }
    }

    /// Server-supplied message of a non-success answer.
    pub fn server_message(&self) -> Option<&str> {
        match &self.kind {
            FetchErrorKind::Status { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Wire payload does not match the resolved schema.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}, column {column}: cannot parse {value:?} as {kind}")]
    Parse {
        line: usize,
        column: usize,
        value: String,
        kind: &'static str,
    },

    #[error("line {line}: {reason}")]
    Text { line: usize, reason: String },

    #[error(
        "binary payload of {actual_len} bytes is not a multiple of the {record_len}-byte record length (misaligned at byte {offset})"
    )]
    Misaligned {
        record_len: usize,
        actual_len: u64,
        offset: u64,
    },

    #[error("byte {offset}: field {name} is not valid UTF-8")]
    InvalidUtf8 { offset: u64, name: String },

    #[error("record {record}: field {name} does not match declared shape {expected:?}")]
    Shape {
        record: usize,
        name: String,
        expected: Vec<usize>,
    },

    #[error("read failed after {offset} bytes: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },
}

/// Local storage failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("cannot encode cache entry: {0}")]
    Encode(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// State of a data request in which a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolvingSchema,
    CheckingCache,
    Fetching,
    Decoding,
    Caching,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolvingSchema => "resolving schema",
            Stage::CheckingCache => "checking cache",
            Stage::Fetching => "fetching",
            Stage::Decoding => "decoding",
            Stage::Caching => "caching",
        };
        f.write_str(name)
    }
}

/// Failure of [`Client::get`](crate::Client::get), tagged with its stage.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct GetError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl GetError {
    pub(crate) fn at(stage: Stage) -> impl FnOnce(Error) -> GetError {
        move |source| GetError { stage, source }
    }

    pub fn error(&self) -> &Error {
        &self.source
    }

    pub fn into_error(self) -> Error {
        self.source
    }
}

/// Either `{"status": {"code", "message"}}` (HAPI status document) or a flat
/// `{"code", "message"}`.
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct HapiErrorBody {
    #[serde(default)]
    status: Option<HapiStatus>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct HapiStatus {
    pub(crate) code: i64,
    #[serde(default)]
    pub(crate) message: String,
}

impl HapiErrorBody {
    fn into_status(self) -> Option<HapiStatus> {
        if let Some(status) = self.status {
            return Some(status);
        }
        self.code.map(|code| HapiStatus {
            code,
            message: self.message.unwrap_or_default(),
        })
    }
}

pub(crate) fn parse_status_body(text: &str) -> Option<HapiStatus> {
    serde_json::from_str::<HapiErrorBody>(text)
        .ok()
        .and_then(HapiErrorBody::into_status)
}

/// Builds the error for a non-success answer from the server.
pub(crate) fn status_error(http_status: u16, url: &str, body: &str) -> FetchError {
    let (code, message) = match parse_status_body(body) {
        Some(status) => (Some(status.code), status.message),
        None => (None, body.to_string()),
    };
    FetchError::new(
        url,
        FetchErrorKind::Status {
            http_status,
            code,
            message,
        },
    )
}

/// Reclassifies "unknown dataset" and "unknown parameter" answers as schema
/// errors; all other failures stay fetch errors.
pub(crate) fn classify_fetch(err: FetchError, dataset: &str, parameter: Option<&str>) -> Error {
    if let FetchErrorKind::Status {
        code: Some(code),
        message,
        ..
    } = &err.kind
    {
        if *code == HAPI_UNKNOWN_DATASET {
            return SchemaError::UnknownDataset {
                dataset: dataset.to_string(),
                message: message.clone(),
            }
            .into();
        }
        if *code == HAPI_UNKNOWN_PARAMETER {
            return SchemaError::UnknownParameter {
                dataset: dataset.to_string(),
                name: parameter.unwrap_or(message.as_str()).to_string(),
            }
            .into();
        }
    }
    err.into()
}
