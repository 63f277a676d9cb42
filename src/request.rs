use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::decode::Format;
use crate::error::SchemaError;
use crate::schema::Selection;
use crate::time::TimeRange;

/// What to fetch: server, dataset, parameters and time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub server: String,
    pub dataset: String,
    /// Empty selects every parameter.
    pub parameters: Vec<String>,
    pub start: String,
    pub stop: String,
}

impl DataRequest {
    pub fn new(server: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            dataset: dataset.into(),
            parameters: Vec::new(),
            start: String::new(),
            stop: String::new(),
        }
    }

    /// Sets the selection from a HAPI comma-separated list such as `"scalar,vector"`.
    pub fn parameters(mut self, list: &str) -> Self {
        self.parameters = Selection::split_list(list);
        self
    }

    pub fn with_parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn time_range(mut self, start: impl Into<String>, stop: impl Into<String>) -> Self {
        self.start = start.into();
        self.stop = stop.into();
        self
    }

    pub(crate) fn range(&self) -> Result<TimeRange, SchemaError> {
        TimeRange::parse(&self.start, &self.stop)
    }
}

/// Shared flag that aborts an in-flight request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-request overrides of the client configuration.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// `None` picks binary when the server advertises it, CSV otherwise.
    pub format: Option<Format>,
    pub timeout: Option<Duration>,
    pub cache_read: Option<bool>,
    pub cache_write: Option<bool>,
    /// Split ranges longer than the dataset's `maxRequestDuration`.
    pub split_long_requests: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            format: None,
            timeout: None,
            cache_read: None,
            cache_write: None,
            split_long_requests: true,
            cancel: None,
        }
    }
}

impl RequestOptions {
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_read(mut self, read: bool) -> Self {
        self.cache_read = Some(read);
        self
    }

    pub fn with_cache_write(mut self, write: bool) -> Self {
        self.cache_write = Some(write);
        self
    }

    pub fn with_split_long_requests(mut self, split: bool) -> Self {
        self.split_long_requests = split;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}
