use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Url;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheEntry, CacheKey, CacheManager, CachePolicy, CacheScope};
use crate::config::{ClientConfig, ConfigError};
use crate::decode::{Format, decode};
use crate::error::{
    CacheError, DecodeError, Error, FetchError, FetchErrorKind, GetError, Stage, classify_fetch,
};
use crate::metadata::{self, CatalogEntry};
use crate::record::{DataRecord, HapiData};
use crate::request::{CancelToken, DataRequest, RequestOptions};
use crate::schema::{DatasetSchema, Selection, resolve};
use crate::time::{TimeRange, format_hapi_time};
use crate::transport::{HttpTransport, Transport};
use crate::util::{endpoint, parse_server, server_id};

/// HAPI client: metadata lookups plus the cached data engine.
///
/// Dataset schemas and server capabilities are memoized for the life of the
/// client; decoded data is cached on disk according to [`ClientConfig`].
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    cache: CacheManager,
    schemas: Mutex<HashMap<(String, String), DatasetSchema>>,
    capabilities: Mutex<HashMap<String, Vec<String>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything one chunk of a request needs.
struct Plan<'a> {
    server: &'a str,
    base: &'a Url,
    schema: &'a DatasetSchema,
    selection: &'a Selection,
    projected: &'a DatasetSchema,
    format: Format,
    policy: CachePolicy,
    options: &'a RequestOptions,
    timeout: Duration,
}

impl Client {
    /// Creates a client using environment variables and/or `.hapirc`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Creates a client that talks HTTP(S) through [`HttpTransport`].
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let cache = CacheManager::new(config.cache_dir.clone(), config.cache_policy());
        Self {
            config,
            transport,
            cache,
            schemas: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.config.progress = progress;
        self
    }

    /// Removes on-disk data for `scope`.
    pub fn clear_cache(&self, scope: &CacheScope) -> Result<(), Error> {
        Ok(self.cache.clear(scope)?)
    }

    /// Lists known HAPI servers from [`ClientConfig::servers_url`].
    #[instrument(skip(self), fields(url = %self.config.servers_url))]
    pub fn list_servers(&self) -> Result<Vec<String>, Error> {
        let url = parse_server(&self.config.servers_url)?;
        let text = metadata::get_text(&*self.transport, url.as_str(), self.config.request_timeout)?;
        let servers = metadata::parse_server_list(&text);
        debug!(count = servers.len(), "server list");
        Ok(servers)
    }

    #[instrument(skip(self))]
    pub fn list_catalog(&self, server: &str) -> Result<Vec<CatalogEntry>, Error> {
        let base = parse_server(server)?;
        let url = endpoint(&base, "catalog", &[]);
        let doc = metadata::get_json(&*self.transport, &url, self.config.request_timeout)?;
        metadata::parse_catalog(&url, doc)
    }

    /// Output formats the server advertises, e.g. `["csv", "binary"]`.
    pub fn capabilities(&self, server: &str) -> Result<Vec<String>, Error> {
        let base = parse_server(server)?;
        self.capabilities_at(&base, self.config.request_timeout)
    }

    fn capabilities_at(&self, base: &Url, timeout: Duration) -> Result<Vec<String>, Error> {
        let id = server_id(base);
        if let Some(formats) = lock(&self.capabilities).get(&id) {
            return Ok(formats.clone());
        }

        let url = endpoint(base, "capabilities", &[]);
        let doc = metadata::get_json(&*self.transport, &url, timeout)?;
        let formats = metadata::parse_capabilities(&url, doc)?;
        lock(&self.capabilities).insert(id, formats.clone());
        Ok(formats)
    }

    /// Fetches and validates the `info` document for `dataset`.
    pub fn dataset_schema(&self, server: &str, dataset: &str) -> Result<DatasetSchema, Error> {
        let base = parse_server(server)?;
        self.schema_at(&base, dataset, self.config.request_timeout, &RequestOptions::default())
    }

    fn schema_at(
        &self,
        base: &Url,
        dataset: &str,
        timeout: Duration,
        options: &RequestOptions,
    ) -> Result<DatasetSchema, Error> {
        let memo_key = (server_id(base), dataset.to_string());
        if let Some(schema) = lock(&self.schemas).get(&memo_key) {
            return Ok(schema.clone());
        }

        let url = endpoint(base, "info", &[("id", dataset)]);
        check_cancel(options, &url)?;
        let doc = metadata::get_json(&*self.transport, &url, timeout)
            .map_err(|e| reclassify(e, dataset))?;
        let schema = resolve(dataset, &doc)?;
        debug!(dataset, parameters = schema.parameters.len(), "resolved schema");

        lock(&self.schemas).insert(memo_key, schema.clone());
        Ok(schema)
    }

    /// Fetches `request`, serving it from the on-disk cache when possible.
    ///
    /// Unknown parameter names and unparsable times fail before any data
    /// request is sent. Failures carry the [`Stage`] they happened in.
    #[instrument(skip_all, fields(server = %request.server, dataset = %request.dataset))]
    pub fn get(&self, request: &DataRequest, options: &RequestOptions) -> Result<HapiData, GetError> {
        let resolving = |e: Error| GetError {
            stage: Stage::ResolvingSchema,
            source: e,
        };

        let base = parse_server(&request.server).map_err(resolving)?;
        let range = request.range().map_err(|e| resolving(e.into()))?;
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);

        let schema = self
            .schema_at(&base, &request.dataset, timeout, options)
            .map_err(resolving)?;
        let selection = schema
            .select(&request.parameters)
            .map_err(|e| resolving(e.into()))?;
        let projected = schema.project(&selection);
        let format = self.choose_format(&base, options, timeout);

        let server = server_id(&base);
        let plan = Plan {
            server: &server,
            base: &base,
            schema: &schema,
            selection: &selection,
            projected: &projected,
            format,
            policy: CachePolicy {
                read: options.cache_read.unwrap_or(self.config.cache_read),
                write: options.cache_write.unwrap_or(self.config.cache_write),
                ttl: self.config.cache_ttl,
            },
            options,
            timeout,
        };

        let chunks = match schema.max_request_duration {
            Some(max) if options.split_long_requests => range.split(max),
            _ => vec![range],
        };
        if chunks.len() > 1 {
            info!(chunks = chunks.len(), "splitting request by maxRequestDuration");
        }

        let mut records = Vec::new();
        let mut from_cache = true;
        for chunk in &chunks {
            let (mut part, hit) = self.get_chunk(&plan, chunk)?;
            from_cache &= hit;
            records.append(&mut part);
        }

        info!(records = records.len(), %format, from_cache, "request complete");
        Ok(HapiData {
            schema: projected,
            records,
            format,
            from_cache,
        })
    }

    fn choose_format(&self, base: &Url, options: &RequestOptions, timeout: Duration) -> Format {
        if let Some(format) = options.format {
            return format;
        }
        match self.capabilities_at(base, timeout) {
            Ok(formats) if formats.iter().any(|f| f.eq_ignore_ascii_case("binary")) => Format::Binary,
            Ok(_) => Format::Csv,
            Err(e) => {
                warn!(error = %e, "capabilities unavailable; using csv");
                Format::Csv
            }
        }
    }

    /// One pass of check-cache, fetch, decode, store for a single range.
    fn get_chunk(&self, plan: &Plan<'_>, range: &TimeRange) -> Result<(Vec<DataRecord>, bool), GetError> {
        let key = CacheKey::new(
            plan.server,
            &plan.schema.id,
            plan.selection.names(),
            range,
            plan.format,
        );
        let _inflight = self.cache.acquire(&key);

        match self.cache.lookup_with(&key, &plan.policy) {
            Ok(Some(entry)) if entry.schema == *plan.projected => {
                debug!(digest = %key.digest(), records = entry.records.len(), "cache hit");
                return Ok((entry.records, true));
            }
            Ok(Some(_)) => debug!(digest = %key.digest(), "cached schema differs; refetching"),
            Ok(None) => debug!(digest = %key.digest(), "cache miss"),
            Err(CacheError::Corrupt { path, reason }) => {
                warn!(path = %path.display(), %reason, "corrupt cache entry; refetching");
            }
            Err(e) => {
                return Err(GetError {
                    stage: Stage::CheckingCache,
                    source: e.into(),
                });
            }
        }

        let records = self.fetch_records(plan, range)?;

        let entry = CacheEntry {
            key,
            schema: plan.projected.clone(),
            records,
            fetched_at: Utc::now(),
        };
        self.cache
            .store_with(&entry.key, &entry, &plan.policy)
            .map_err(|e| GetError {
                stage: Stage::Caching,
                source: e.into(),
            })?;
        Ok((entry.records, false))
    }

    fn fetch_records(&self, plan: &Plan<'_>, range: &TimeRange) -> Result<Vec<DataRecord>, GetError> {
        let fetching = GetError::at(Stage::Fetching);
        let url = data_url(plan.base, plan.schema, plan.selection, range, plan.format);

        check_cancel(plan.options, &url).map_err(GetError::at(Stage::Fetching))?;
        info!(url = %url, "requesting data");
        let response = metadata::open(&*self.transport, &url, plan.timeout)
            .map_err(|e| fetching(reclassify(e, &plan.schema.id)))?;

        let progress = match response.content_length() {
            Some(len) if self.config.progress => Some(progress_bar(len)),
            _ => None,
        };
        let body: Box<dyn Read + Send> = match &progress {
            Some(pb) => Box::new(pb.wrap_read(response.body)),
            None => response.body,
        };
        let body = Cancellable {
            inner: body,
            cancel: plan.options.cancel.clone(),
        };

        let mut records = Vec::new();
        for item in decode(plan.format, body, plan.schema, plan.selection) {
            match item {
                Ok(record) => records.push(record),
                Err(DecodeError::Read { source, .. }) => {
                    return Err(GetError {
                        stage: Stage::Fetching,
                        source: read_failure(&url, source),
                    });
                }
                Err(e) => {
                    return Err(GetError {
                        stage: Stage::Decoding,
                        source: e.into(),
                    });
                }
            }
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        debug!(records = records.len(), "decoded");
        Ok(records)
    }
}

fn data_url(
    base: &Url,
    schema: &DatasetSchema,
    selection: &Selection,
    range: &TimeRange,
    format: Format,
) -> String {
    let (id, min, max) = if schema.uses_v3_queries() {
        ("dataset", "start", "stop")
    } else {
        ("id", "time.min", "time.max")
    };
    let start = format_hapi_time(&range.start);
    let stop = format_hapi_time(&range.stop);
    let parameters = selection.query_value();

    let mut query = vec![(id, schema.id.as_str()), (min, start.as_str()), (max, stop.as_str())];
    if let Some(p) = &parameters {
        query.push(("parameters", p.as_str()));
    }
    if format == Format::Binary {
        query.push(("format", "binary"));
    }
    endpoint(base, "data", &query)
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
    ) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_cancel(options: &RequestOptions, url: &str) -> Result<(), Error> {
    if options.is_cancelled() {
        return Err(FetchError::new(url, FetchErrorKind::Cancelled).into());
    }
    Ok(())
}

/// Maps HAPI "unknown dataset/parameter" answers to schema errors.
fn reclassify(err: Error, dataset: &str) -> Error {
    match err {
        Error::Fetch(f) => classify_fetch(f, dataset, None),
        other => other,
    }
}

fn read_failure(url: &str, err: io::Error) -> Error {
    let kind = if err.get_ref().is_some_and(|e| e.is::<Cancelled>()) {
        FetchErrorKind::Cancelled
    } else if err.kind() == io::ErrorKind::TimedOut {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::Transport(err.to_string())
    };
    FetchError::new(url, kind).into()
}

#[derive(Debug)]
struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Body reader that stops once the token is cancelled.
struct Cancellable<R> {
    inner: R,
    cancel: Option<CancelToken>,
}

impl<R: Read> Read for Cancellable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(io::Error::other(Cancelled));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(version: &str) -> DatasetSchema {
        resolve(
            "dataset1",
            &json!({
                "HAPI": version,
                "startDate": "1970-01-01Z",
                "stopDate": "2016-12-31Z",
                "parameters": [
                    {"name": "Time", "type": "isotime", "length": 20},
                    {"name": "scalar", "type": "double"},
                    {"name": "vector", "type": "double", "size": [3]}
                ]
            }),
        )
        .unwrap()
    }

    #[test]
    fn data_url_query_names_follow_hapi_version() {
        let base = parse_server("http://x.org/hapi").unwrap();
        let range = TimeRange::parse("1970-01-01", "1970-01-01T00:00:10Z").unwrap();

        let v3 = schema("3.1");
        let sel = v3.select(&["vector"]).unwrap();
        assert_eq!(
            data_url(&base, &v3, &sel, &range, Format::Binary),
            "http://x.org/hapi/data?dataset=dataset1&start=1970-01-01T00%3A00%3A00Z&stop=1970-01-01T00%3A00%3A10Z&parameters=vector&format=binary"
        );

        let v2 = schema("2.0");
        let all = v2.select::<&str>(&[]).unwrap();
        assert_eq!(
            data_url(&base, &v2, &all, &range, Format::Csv),
            "http://x.org/hapi/data?id=dataset1&time.min=1970-01-01T00%3A00%3A00Z&time.max=1970-01-01T00%3A00%3A10Z"
        );
    }

    #[test]
    fn cancelled_reader_reports_cancellation() {
        let token = CancelToken::new();
        let mut reader = Cancellable {
            inner: io::Cursor::new(vec![1u8, 2, 3]),
            cancel: Some(token.clone()),
        };
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        token.cancel();
        let err = reader.read(&mut buf).unwrap_err();
        match read_failure("u", err) {
            Error::Fetch(e) => assert_eq!(e.kind, FetchErrorKind::Cancelled),
            other => panic!("unexpected {other:?}"),
        }

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            read_failure("u", timed_out),
            Error::Fetch(FetchError { kind: FetchErrorKind::Timeout, .. })
        ));
    }
}
