//! A Rust client for the Heliophysics Data Application Programmer's Interface (HAPI).
//!
//! This crate implements the usual HAPI flow:
//! discover servers and datasets, resolve a dataset's typed schema, then fetch
//! time-tagged records as CSV or binary and decode them against that schema.
//! Decoded data is cached on disk so repeated requests skip the network.
//!
//! ## Quick start
//! - Optionally configure caching via environment variables (`HAPI_CACHE_DIR`,
//!   `HAPI_CACHE_READ`, `HAPI_CACHE_WRITE`, `HAPI_TIMEOUT`, ...) or a `.hapirc`
//!   file (supported in the current directory and in your home directory).
//! - Call [`Client::get`] with a [`DataRequest`].
//!
//! ```no_run
//! use anyhow::Result;
//! use hapi_client::{Client, DataRequest, RequestOptions};
//!
//! fn main() -> Result<()> {
//!     let client = Client::from_env()?;
//!     let request = DataRequest::new("http://hapi-server.org/servers/TestData2.0/hapi", "dataset1")
//!         .parameters("scalar,vector")
//!         .time_range("1970-01-01", "1970-01-01T00:00:11Z");
//!     let data = client.get(&request, &RequestOptions::default())?;
//!     for record in &data.records {
//!         println!("{:?} {:?}", record.time(), record.get("vector"));
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

mod cache;
mod client;
mod config;
mod decode;
mod error;
mod metadata;
mod record;
mod request;
mod schema;
mod time;
mod transport;
mod util;

pub use cache::{CacheEntry, CacheKey, CacheManager, CachePolicy, CacheScope, InflightGuard};
pub use client::Client;
pub use config::{ClientConfig, ConfigError, DEFAULT_SERVERS_URL, default_cache_dir};
pub use decode::{
    BinaryDecoder, CsvDecoder, Format, Records, decode, encode_binary, encode_csv,
};
pub use error::{
    CacheError, DecodeError, Error, FetchError, FetchErrorKind, GetError, HAPI_OK,
    HAPI_UNKNOWN_DATASET, HAPI_UNKNOWN_PARAMETER, Result, SchemaError, Stage,
};
pub use metadata::CatalogEntry;
pub use record::{DataRecord, FieldValue, HapiData, Value};
pub use request::{CancelToken, DataRequest, RequestOptions};
pub use schema::{
    DEFAULT_ISOTIME_LENGTH, DatasetSchema, FieldLayout, MAX_RECORD_BYTES, ParamType,
    ParameterSchema, RecordLayout, Selection, resolve,
};
pub use time::{TimeRange, format_hapi_time, parse_hapi_time, parse_iso_duration};
pub use transport::{HttpResponse, HttpTransport, Transport, TransportError};
