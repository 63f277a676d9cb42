//! Thin fetchers for the HAPI metadata endpoints.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, FetchError, FetchErrorKind, HAPI_OK, parse_status_body, status_error};
use crate::transport::{HttpResponse, Transport, TransportError};

/// One dataset advertised by a server's `catalog` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Deserialize)]
struct CatalogDocument {
    catalog: Vec<CatalogItem>,
}

#[derive(Deserialize)]
struct CatalogItem {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitiesDocument {
    #[serde(default)]
    output_formats: Vec<String>,
}

pub(crate) fn transport_error(url: &str, err: TransportError) -> Error {
    match err {
        TransportError::Connect(reason) => Error::address(url, reason),
        TransportError::Timeout => FetchError::new(url, FetchErrorKind::Timeout).into(),
        TransportError::Other(msg) => FetchError::new(url, FetchErrorKind::Transport(msg)).into(),
    }
}

fn read_error(url: &str, err: std::io::Error) -> Error {
    let kind = if err.kind() == std::io::ErrorKind::TimedOut {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::Transport(err.to_string())
    };
    FetchError::new(url, kind).into()
}

/// Issues a GET and fails on any non-success status, carrying the server's
/// status document verbatim.
pub(crate) fn open(
    transport: &dyn Transport,
    url: &str,
    timeout: Duration,
) -> Result<HttpResponse, Error> {
    debug!(url, "fetching");
    let response = transport
        .fetch(url, timeout)
        .map_err(|e| transport_error(url, e))?;
    if response.is_success() {
        return Ok(response);
    }

    let status = response.status;
    let body = response.text().unwrap_or_default();
    Err(status_error(status, url, &body).into())
}

pub(crate) fn get_text(transport: &dyn Transport, url: &str, timeout: Duration) -> Result<String, Error> {
    open(transport, url, timeout)?
        .text()
        .map_err(|e| read_error(url, e))
}

/// Fetches a JSON document and checks its HAPI status code.
pub(crate) fn get_json(
    transport: &dyn Transport,
    url: &str,
    timeout: Duration,
) -> Result<serde_json::Value, Error> {
    let response = open(transport, url, timeout)?;
    let http_status = response.status;
    let text = response.text().map_err(|e| read_error(url, e))?;

    let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        FetchError::new(url, FetchErrorKind::InvalidBody(e.to_string()))
    })?;

    if let Some(status) = parse_status_body(&text) {
        if status.code != HAPI_OK {
            return Err(FetchError::new(
                url,
                FetchErrorKind::Status {
                    http_status,
                    code: Some(status.code),
                    message: status.message,
                },
            )
            .into());
        }
    }
    Ok(value)
}

pub(crate) fn parse_catalog(url: &str, value: serde_json::Value) -> Result<Vec<CatalogEntry>, Error> {
    let doc: CatalogDocument = serde_json::from_value(value)
        .map_err(|e| FetchError::new(url, FetchErrorKind::InvalidBody(e.to_string())))?;
    Ok(doc
        .catalog
        .into_iter()
        .map(|item| CatalogEntry {
            id: item.id,
            title: item.title.unwrap_or_default(),
        })
        .collect())
}

pub(crate) fn parse_capabilities(url: &str, value: serde_json::Value) -> Result<Vec<String>, Error> {
    let doc: CapabilitiesDocument = serde_json::from_value(value)
        .map_err(|e| FetchError::new(url, FetchErrorKind::InvalidBody(e.to_string())))?;
    Ok(doc.output_formats)
}

/// One server URL per line; blank and `#` lines are skipped.
pub(crate) fn parse_server_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    struct Canned(u16, &'static str);

    impl Transport for Canned {
        fn fetch(&self, _url: &str, _timeout: Duration) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse::new(
                self.0,
                Vec::new(),
                Box::new(Cursor::new(self.1.as_bytes().to_vec())),
            ))
        }
    }

    struct Unreachable;

    impl Transport for Unreachable {
        fn fetch(&self, _url: &str, _timeout: Duration) -> Result<HttpResponse, TransportError> {
            Err(TransportError::Connect("connection refused".to_string()))
        }
    }

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn catalog_titles_default_to_empty() {
        let doc = json!({
            "HAPI": "3.0",
            "status": {"code": 1200, "message": "OK"},
            "catalog": [{"id": "dataset1", "title": "Dataset 1"}, {"id": "dataset2"}]
        });
        let entries = parse_catalog("u", doc).unwrap();
        assert_eq!(entries[0].title, "Dataset 1");
        assert_eq!(entries[1], CatalogEntry { id: "dataset2".into(), title: String::new() });
        assert!(parse_catalog("u", json!({"datasets": []})).is_err());
    }

    #[test]
    fn ok_http_with_error_status_code() {
        let t = Canned(200, r#"{"HAPI":"2.0","status":{"code":1501,"message":"upstream failure"}}"#);
        match get_json(&t, "u", T) {
            Err(Error::Fetch(e)) => {
                assert_eq!(
                    e.kind,
                    FetchErrorKind::Status {
                        http_status: 200,
                        code: Some(1501),
                        message: "upstream failure".to_string()
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_json_and_unreachable_server() {
        assert!(matches!(
            get_json(&Canned(200, "<html>"), "u", T),
            Err(Error::Fetch(FetchError { kind: FetchErrorKind::InvalidBody(_), .. }))
        ));
        assert!(matches!(get_json(&Unreachable, "u", T), Err(Error::Address { .. })));
    }

    #[test]
    fn server_list_lines() {
        let text = "# servers\nhttp://a.org/hapi\n\n  https://b.org/hapi  \n#http://c.org/hapi\n";
        assert_eq!(parse_server_list(text), vec!["http://a.org/hapi", "https://b.org/hapi"]);
    }

    #[test]
    fn capabilities_formats() {
        let formats = parse_capabilities("u", json!({"outputFormats": ["csv", "binary", "json"]})).unwrap();
        assert_eq!(formats, vec!["csv", "binary", "json"]);
    }
}
