use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::cache::CachePolicy;

/// Community-maintained list of public HAPI servers.
pub const DEFAULT_SERVERS_URL: &str = "https://github.com/hapi-server/servers/raw/master/all.txt";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Rc-file key and environment variable for every setting, in load order.
const SETTINGS: [(&str, &str); 8] = [
    ("cache_dir", "HAPI_CACHE_DIR"),
    ("cache_read", "HAPI_CACHE_READ"),
    ("cache_write", "HAPI_CACHE_WRITE"),
    ("timeout", "HAPI_TIMEOUT"),
    ("cache_ttl", "HAPI_CACHE_TTL"),
    ("servers_url", "HAPI_SERVERS_URL"),
    ("verify", "HAPI_VERIFY"),
    ("progress", "HAPI_PROGRESS"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Serve data from the on-disk cache when a matching entry exists.
    pub cache_read: bool,
    /// Write freshly decoded data to the on-disk cache.
    pub cache_write: bool,
    pub cache_dir: PathBuf,
    /// Per-request timeout, unless a request overrides it.
    pub request_timeout: Duration,
    /// Entries older than this are treated as missing.
    pub cache_ttl: Option<Duration>,
    /// Where [`Client::list_servers`](crate::Client::list_servers) reads the server list.
    pub servers_url: String,
    /// Whether to verify TLS certificates.
    pub verify: bool,
    /// Show a progress bar while data bodies download.
    pub progress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_read: true,
            cache_write: true,
            cache_dir: default_cache_dir(),
            request_timeout: DEFAULT_TIMEOUT,
            cache_ttl: None,
            servers_url: DEFAULT_SERVERS_URL.to_string(),
            verify: true,
            progress: false,
        }
    }
}

impl ClientConfig {
    /// Builds a configuration from (in order of precedence):
    /// - environment variables `HAPI_CACHE_DIR`, `HAPI_CACHE_READ`, `HAPI_CACHE_WRITE`,
    ///   `HAPI_TIMEOUT`, `HAPI_CACHE_TTL`, `HAPI_SERVERS_URL`, `HAPI_VERIFY`, `HAPI_PROGRESS`
    /// - config file from `HAPI_RC` or `.hapirc`
    /// - built-in defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = |name: &str| std::env::var(name).ok();
        let candidates = rc_candidates(&env);
        load_config(env, &candidates)
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_cache_read(mut self, read: bool) -> Self {
        self.cache_read = read;
        self
    }

    pub fn with_cache_write(mut self, write: bool) -> Self {
        self.cache_write = write;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_servers_url(mut self, url: impl Into<String>) -> Self {
        self.servers_url = url.into();
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub(crate) fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            read: self.cache_read,
            write: self.cache_write,
            ttl: self.cache_ttl,
        }
    }
}

/// `<platform cache dir>/hapi-data`, or under the temp dir when the platform
/// has no cache dir.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hapi-data")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key} {value:?} from {origin}: {reason}")]
    Invalid {
        key: String,
        value: String,
        origin: String,
        reason: String,
    },

    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Default)]
struct RcConfig {
    path: Option<PathBuf>,
    values: HashMap<String, String>,
}

pub(crate) fn load_config<F>(env: F, rc_candidates: &[PathBuf]) -> Result<ClientConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut rc = RcConfig::default();
    for rc_path in rc_candidates {
        if rc_path.exists() {
            rc = read_rc(rc_path)?;
            break;
        }
    }

    let mut cfg = ClientConfig::default();
    for (key, var) in SETTINGS {
        let from_env = env(var).filter(|v| !v.trim().is_empty());
        let (value, origin) = match (from_env, rc.values.get(key)) {
            (Some(v), _) => (v, format!("environment variable {}", var)),
            (None, Some(v)) => (
                v.clone(),
                rc.path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            (None, None) => continue,
        };
        apply(&mut cfg, key, value.trim(), &origin)?;
    }

    Ok(cfg)
}

fn apply(cfg: &mut ClientConfig, key: &str, value: &str, origin: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        origin: origin.to_string(),
        reason: reason.to_string(),
    };
    let boolean = || parse_bool(value).ok_or_else(|| invalid("expected 0/1/true/false/yes/no"));
    let seconds = || parse_seconds(value).ok_or_else(|| invalid("expected a positive number of seconds"));

    match key {
        "cache_dir" => cfg.cache_dir = PathBuf::from(value),
        "cache_read" => cfg.cache_read = boolean()?,
        "cache_write" => cfg.cache_write = boolean()?,
        "timeout" => cfg.request_timeout = seconds()?,
        "cache_ttl" => cfg.cache_ttl = Some(seconds()?),
        "servers_url" => cfg.servers_url = value.to_string(),
        "verify" => cfg.verify = boolean()?,
        "progress" => cfg.progress = boolean()?,
        _ => {}
    }
    Ok(())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_seconds(s: &str) -> Option<Duration> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(Duration::from_secs_f64)
}

fn is_setting(key: &str) -> bool {
    SETTINGS.iter().any(|(k, _)| *k == key)
}

fn read_rc(path: &Path) -> Result<RcConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg = RcConfig {
        path: Some(path.to_path_buf()),
        values: HashMap::new(),
    };

    // `key:` may stand alone with its value on the next line.
    let mut pending_key: Option<&str> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let split = line
            .split_once(':')
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, _)| is_setting(k));

        if let Some(pk) = pending_key.take() {
            if split.is_none() {
                cfg.values.insert(pk.to_string(), strip_quotes(line).to_string());
                continue;
            }
        }

        if let Some((k, v)) = split {
            let v = strip_quotes(v);
            if v.is_empty() {
                pending_key = Some(k);
            } else {
                cfg.values.insert(k.to_string(), v.to_string());
            }
        }
    }

    Ok(cfg)
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn rc_candidates(env: &dyn Fn(&str) -> Option<String>) -> Vec<PathBuf> {
    // 1) HAPI_RC (explicit)
    // 2) ./.hapirc
    // 3) ~/.hapirc
    if let Some(p) = env("HAPI_RC").filter(|p| !p.trim().is_empty()) {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".hapirc"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".hapirc"));
    }
    v
}
