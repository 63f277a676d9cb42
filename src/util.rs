use reqwest::Url;
use std::time::Duration;

use crate::error::Error;

pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 500 | 502 | 503 | 504 | 429 | 408)
}

pub(crate) fn backoff(current: Duration, max: Duration) -> Duration {
    let next = Duration::from_secs_f64((current.as_secs_f64() * 1.5).max(1.0));
    if next > max { max } else { next }
}

/// Validates a HAPI server base URL such as `https://host/hapi`.
pub(crate) fn parse_server(server: &str) -> Result<Url, Error> {
    let trimmed = server.trim();
    if trimmed.is_empty() {
        return Err(Error::address(server, "empty address"));
    }
    let url = Url::parse(trimmed).map_err(|e| Error::address(server, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(Error::address(server, format!("unsupported scheme {}", other))),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::address(server, "missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::address(server, "base URL must not carry a query or fragment"));
    }
    Ok(url)
}

/// `<base>/<name>?<query>`, with query values percent-encoded.
pub(crate) fn endpoint(base: &Url, name: &str, query: &[(&str, &str)]) -> String {
    let mut url = base.clone();
    let path = format!("{}/{}", base.path().trim_end_matches('/'), name);
    url.set_path(&path);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    url.to_string()
}

/// The server URL as used in cache keys and memo tables.
pub(crate) fn server_id(base: &Url) -> String {
    base.as_str().trim_end_matches('/').to_string()
}
