//! The HTTP collaborator.
//!
//! The engine only needs "GET this URL and give me a status, headers and a
//! byte stream". [`HttpTransport`] is the real implementation; tests plug in
//! their own [`Transport`].

use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::fmt;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::util::{backoff, retriable_status};

pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-case.
    pub headers: Vec<(String, String)>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Box<dyn Read + Send>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Reads the whole body as (lossy) UTF-8.
    pub fn text(mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        self.body.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The server could not be reached at all.
    #[error("cannot connect: {0}")]
    Connect(String),
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    retry_max: usize,
    sleep_max: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("hapi-client-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("hapi-client-rs")),
        );

        let mut builder = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(config.request_timeout);

        if !config.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            http,
            retry_max: 3,
            sleep_max: Duration::from_secs(10),
        })
    }

    /// Attempts per request, including the first.
    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.retry_max = retry_max.max(1);
        self
    }

    pub fn with_sleep_max(mut self, sleep_max: Duration) -> Self {
        self.sleep_max = sleep_max;
        self
    }

    fn robust_request<F>(&self, url: &str, mut f: F) -> Result<Response, TransportError>
    where
        F: FnMut() -> Result<Response, reqwest::Error>,
    {
        let mut tries = 0usize;
        let mut sleep = Duration::ZERO;
        loop {
            tries += 1;
            match f() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if retriable_status(status) && tries < self.retry_max {
                        sleep = backoff(sleep, self.sleep_max);
                        warn!(url, status, attempt = tries, "transient HTTP status; retrying");
                        thread::sleep(sleep);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) if err.is_timeout() => return Err(TransportError::Timeout),
                Err(err) => {
                    let transient = err.is_connect() || err.is_request();
                    if transient && tries < self.retry_max {
                        sleep = backoff(sleep, self.sleep_max);
                        warn!(url, error = %err, attempt = tries, "request failed; retrying");
                        thread::sleep(sleep);
                        continue;
                    }
                    return Err(if err.is_connect() {
                        TransportError::Connect(err.to_string())
                    } else {
                        TransportError::Other(err.to_string())
                    });
                }
            }
        }
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        debug!(url, "GET");
        let resp = self.robust_request(url, || self.http.get(url).timeout(timeout).send())?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Ok(HttpResponse::new(status, headers, Box::new(ResponseBody(resp))))
    }
}

/// Surfaces body-read timeouts as [`io::ErrorKind::TimedOut`].
struct ResponseBody(Response);

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(|e| {
            let timed_out = e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
            if timed_out && e.kind() != io::ErrorKind::TimedOut {
                io::Error::new(io::ErrorKind::TimedOut, e.to_string())
            } else {
                e
            }
        })
    }
}
