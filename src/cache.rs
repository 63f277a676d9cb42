//! Content-addressed on-disk cache of decoded data.
//!
//! Layout: `<cache_dir>/<server-dir>/<dataset-dir>/<digest>.json`, where each
//! directory name is a readable slug followed by a hash of the full name. Every file
//! stores the full normalized key next to its digest and is published with a
//! temp-file-then-rename, so readers see either nothing or a whole entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::decode::Format;
use crate::error::CacheError;
use crate::record::DataRecord;
use crate::schema::DatasetSchema;
use crate::time::{TimeRange, format_hapi_time};

const ENTRY_VERSION: u32 = 1;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Normalized identity of a data request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub server: String,
    pub dataset: String,
    /// Sorted, de-duplicated parameter names.
    pub parameters: Vec<String>,
    /// Canonical HAPI times.
    pub start: String,
    pub stop: String,
    pub format: Format,
}

impl CacheKey {
    pub fn new<S: AsRef<str>>(
        server: &str,
        dataset: &str,
        parameters: &[S],
        range: &TimeRange,
        format: Format,
    ) -> Self {
        let mut parameters: Vec<String> = parameters
            .iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        parameters.sort();
        parameters.dedup();

        Self {
            server: server.trim().trim_end_matches('/').to_string(),
            dataset: dataset.trim().to_string(),
            parameters,
            start: format_hapi_time(&range.start),
            stop: format_hapi_time(&range.stop),
            format,
        }
    }

    /// Hex SHA-256 of the normalized key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.server.as_str(),
            self.dataset.as_str(),
            &self.parameters.join(","),
            self.start.as_str(),
            self.stop.as_str(),
            self.format.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A decoded response, immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Projected schema the records were decoded against.
    pub schema: DatasetSchema,
    pub records: Vec<DataRecord>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    version: u32,
    digest: &'a str,
    entry: &'a CacheEntry,
}

#[derive(Deserialize)]
struct EntryDocument {
    version: u32,
    digest: String,
    entry: CacheEntry,
}

/// Which entries [`CacheManager::clear`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Server(String),
    Dataset { server: String, dataset: String },
}

/// Read/write switches and expiry. Reads and writes are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub read: bool,
    pub write: bool,
    pub ttl: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            ttl: None,
        }
    }
}

pub struct CacheManager {
    dir: PathBuf,
    policy: CachePolicy,
    inflight: Mutex<HashSet<String>>,
    released: Condvar,
}

impl CacheManager {
    pub fn new(dir: impl Into<PathBuf>, policy: CachePolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            inflight: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dataset_dir(&key.server, &key.dataset)
            .join(format!("{}.json", key.digest()))
    }

    fn dataset_dir(&self, server: &str, dataset: &str) -> PathBuf {
        self.server_dir(server).join(dir_name(dataset.trim()))
    }

    fn server_dir(&self, server: &str) -> PathBuf {
        let server = server.trim().trim_end_matches('/');
        let bare = server
            .strip_prefix("https://")
            .or_else(|| server.strip_prefix("http://"))
            .unwrap_or(server);
        self.dir.join(format!("{}-{}", slug(bare), short_hash(server)))
    }

    /// Removes a scope directory, refusing anything that is not strictly
    /// below the cache root.
    fn remove_scope(&self, path: &Path) -> Result<(), CacheError> {
        let inside = path.strip_prefix(&self.dir).is_ok_and(|rest| {
            rest.components().next().is_some()
                && rest.components().all(|c| matches!(c, Component::Normal(_)))
        });
        if !inside {
            return Err(CacheError::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path escapes the cache directory"),
            ));
        }
        remove_tree(path)
    }

    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.lookup_with(key, &self.policy)
    }

    /// Returns the entry for `key`, or `None` on a miss (including expired
    /// entries and disabled reads). An entry that cannot be trusted is a
    /// [`CacheError::Corrupt`].
    pub fn lookup_with(
        &self,
        key: &CacheKey,
        policy: &CachePolicy,
    ) -> Result<Option<CacheEntry>, CacheError> {
        if !policy.read {
            return Ok(None);
        }

        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let corrupt = |reason: String| CacheError::Corrupt {
            path: path.clone(),
            reason,
        };
        let doc: EntryDocument =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if doc.version != ENTRY_VERSION {
            debug!(path = %path.display(), version = doc.version, "ignoring cache entry from another version");
            return Ok(None);
        }
        if doc.digest != key.digest() || doc.entry.key != *key {
            return Err(corrupt("stored key does not match request".to_string()));
        }
        for (i, record) in doc.entry.records.iter().enumerate() {
            record
                .conforms_to(&doc.entry.schema, i)
                .map_err(|e| corrupt(e.to_string()))?;
        }

        if let Some(ttl) = policy.ttl {
            let age = Utc::now().signed_duration_since(doc.entry.fetched_at);
            if age.to_std().map(|a| a > ttl).unwrap_or(false) {
                debug!(path = %path.display(), "cache entry expired");
                return Ok(None);
            }
        }

        Ok(Some(doc.entry))
    }

    pub fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        self.store_with(key, entry, &self.policy)
    }

    /// Publishes `entry` atomically. A no-op when writes are disabled.
    pub fn store_with(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        policy: &CachePolicy,
    ) -> Result<(), CacheError> {
        if !policy.write {
            return Ok(());
        }

        let path = self.entry_path(key);
        let dir = self.dataset_dir(&key.server, &key.dataset);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let digest = key.digest();
        let bytes = serde_json::to_vec(&EntryRef {
            version: ENTRY_VERSION,
            digest: &digest,
            entry,
        })
        .map_err(|e| CacheError::Encode(e.to_string()))?;

        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            digest,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = write_synced(&tmp, &bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::io(&tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::io(&path, e));
        }

        debug!(path = %path.display(), records = entry.records.len(), "cache entry written");
        Ok(())
    }

    /// Deletes one entry; missing entries are fine.
    pub fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Removes every entry in `scope`. Clearing an empty scope succeeds.
    pub fn clear(&self, scope: &CacheScope) -> Result<(), CacheError> {
        match scope {
            CacheScope::All => {
                let children = match fs::read_dir(&self.dir) {
                    Ok(rd) => rd,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(CacheError::io(&self.dir, e)),
                };
                for child in children {
                    let child = child.map_err(|e| CacheError::io(&self.dir, e))?;
                    let path = child.path();
                    if path.is_dir() {
                        remove_tree(&path)?;
                    }
                }
                Ok(())
            }
            CacheScope::Server(server) => self.remove_scope(&self.server_dir(server)),
            CacheScope::Dataset { server, dataset } => {
                self.remove_scope(&self.dataset_dir(server, dataset))
            }
        }
    }

    /// Blocks until no other caller holds `key`, then claims it until the
    /// guard is dropped.
    pub fn acquire(&self, key: &CacheKey) -> InflightGuard<'_> {
        let digest = key.digest();
        let mut held = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while held.contains(&digest) {
            debug!(digest = %digest, "waiting for in-flight request");
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(digest.clone());
        InflightGuard {
            manager: self,
            digest,
        }
    }
}

/// Exclusive claim on one cache key within this process.
pub struct InflightGuard<'a> {
    manager: &'a CacheManager,
    digest: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .manager
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.digest);
        self.manager.released.notify_all();
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn remove_tree(path: &Path) -> Result<(), CacheError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to clear cache directory");
            Err(CacheError::io(path, e))
        }
    }
}

fn dir_name(name: &str) -> String {
    format!("{}-{}", slug(name), short_hash(name))
}

// Slugs may collide (`x/y` and `x_y`); the hash suffix keeps directories apart.
fn slug(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn short_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldValue, Value};
    use crate::schema::resolve;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    const SERVER: &str = "http://hapi-server.org/servers/TestData/hapi";

    fn schema() -> DatasetSchema {
        resolve(
            "dataset1",
            &json!({
                "startDate": "1970-01-01Z",
                "stopDate": "2016-12-31Z",
                "parameters": [
                    {"name": "Time", "type": "isotime", "length": 20},
                    {"name": "scalar", "type": "double"}
                ]
            }),
        )
        .unwrap()
    }

    fn key(params: &[&str], start: &str) -> CacheKey {
        let range = TimeRange::parse(start, "1970-01-01T00:00:10Z").unwrap();
        CacheKey::new(SERVER, "dataset1", params, &range, Format::Csv)
    }

    fn entry(key: &CacheKey) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            schema: schema(),
            records: vec![DataRecord::new(vec![
                (
                    "Time".to_string(),
                    FieldValue::Scalar(Value::Time("1970-01-01T00:00:00Z".to_string())),
                ),
                ("scalar".to_string(), FieldValue::Scalar(Value::Double(f64::INFINITY))),
            ])],
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn key_ignores_parameter_order_and_time_spelling() {
        let a = key(&["Time", "vector", "scalar"], "1970-01-01");
        let b = key(&["scalar", "Time", "vector", "scalar"], "1970-001T00:00:00.000Z");
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let c = key(&["scalar"], "1970-01-01");
        assert_ne!(a.digest(), c.digest());

        let range = TimeRange::parse("1970-01-01", "1970-01-02").unwrap();
        let with_slash = CacheKey::new(&format!("{SERVER}/"), "dataset1", &["scalar"], &range, Format::Csv);
        let without = CacheKey::new(SERVER, "dataset1", &["scalar"], &range, Format::Csv);
        assert_eq!(with_slash.digest(), without.digest());
        let binary = CacheKey::new(SERVER, "dataset1", &["scalar"], &range, Format::Binary);
        assert_ne!(binary.digest(), without.digest());
    }

    #[test]
    fn store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path(), CachePolicy::default());
        let k = key(&["scalar"], "1970-01-01");

        assert!(cache.lookup(&k).unwrap().is_none());
        let e = entry(&k);
        cache.store(&k, &e).unwrap();
        assert_eq!(cache.lookup(&k).unwrap(), Some(e));

        let path = cache.entry_path(&k);
        let rel = path.strip_prefix(dir.path()).unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("hapi-server.org_servers_TestData_hapi-"));
        assert!(parts[1].starts_with("dataset1-"));
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn read_and_write_switches_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path(), CachePolicy::default());
        let k = key(&["scalar"], "1970-01-01");
        let e = entry(&k);

        let no_write = CachePolicy {
            write: false,
            ..CachePolicy::default()
        };
        cache.store_with(&k, &e, &no_write).unwrap();
        assert!(!cache.entry_path(&k).exists());

        cache.store(&k, &e).unwrap();
        let no_read = CachePolicy {
            read: false,
            ..CachePolicy::default()
        };
        assert!(cache.lookup_with(&k, &no_read).unwrap().is_none());
        assert!(cache.lookup(&k).unwrap().is_some());
    }

    #[test]
    fn expired_entries_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path(), CachePolicy::default());
        let k = key(&["scalar"], "1970-01-01");
        let mut e = entry(&k);
        e.fetched_at = Utc::now() - chrono::TimeDelta::hours(2);
        cache.store(&k, &e).unwrap();

        let ttl = CachePolicy {
            ttl: Some(Duration::from_secs(3600)),
            ..CachePolicy::default()
        };
        assert!(cache.lookup_with(&k, &ttl).unwrap().is_none());
        assert!(cache.lookup(&k).unwrap().is_some());
    }

    #[test]
    fn corrupt_and_mismatched_entries_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path(), CachePolicy::default());
        let k = key(&["scalar"], "1970-01-01");
        cache.store(&k, &entry(&k)).unwrap();

        fs::write(cache.entry_path(&k), b"{\"version\":1,\"digest\":").unwrap();
        assert!(matches!(cache.lookup(&k), Err(CacheError::Corrupt { .. })));

        let other = key(&["scalar"], "1970-01-01T00:00:01");
        let bytes = serde_json::to_vec(&EntryRef {
            version: ENTRY_VERSION,
            digest: &k.digest(),
            entry: &entry(&other),
        })
        .unwrap();
        fs::write(cache.entry_path(&k), bytes).unwrap();
        assert!(matches!(cache.lookup(&k), Err(CacheError::Corrupt { .. })));

        cache.remove(&k).unwrap();
        cache.remove(&k).unwrap();
        assert!(cache.lookup(&k).unwrap().is_none());
    }

    #[test]
    fn clear_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path(), CachePolicy::default());
        let k1 = key(&["scalar"], "1970-01-01");
        let range = TimeRange::parse("1970-01-01", "1970-01-02").unwrap();
        let k2 = CacheKey::new(SERVER, "dataset2", &["scalar"], &range, Format::Csv);
        let k3 = CacheKey::new("http://other.org/hapi", "dataset1", &["scalar"], &range, Format::Csv);
        for k in [&k1, &k2, &k3] {
            cache.store(k, &entry(k)).unwrap();
        }

        cache
            .clear(&CacheScope::Dataset {
                server: SERVER.to_string(),
                dataset: "dataset2".to_string(),
            })
            .unwrap();
        assert!(cache.entry_path(&k1).exists());
        assert!(!cache.entry_path(&k2).exists());

        cache.clear(&CacheScope::Server(SERVER.to_string())).unwrap();
        assert!(!cache.entry_path(&k1).exists());
        assert!(cache.entry_path(&k3).exists());

        cache.clear(&CacheScope::All).unwrap();
        assert!(!cache.entry_path(&k3).exists());
        cache.clear(&CacheScope::All).unwrap();

        let missing = CacheManager::new(dir.path().join("never-created"), CachePolicy::default());
        missing.clear(&CacheScope::All).unwrap();
    }

    #[test]
    fn clear_stays_inside_the_cache_dir() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("hapi-data");
        let sibling = root.path().join("user-files");
        fs::create_dir_all(&sibling).unwrap();
        fs::write(sibling.join("important.txt"), b"keep").unwrap();
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join("notes.txt"), b"keep").unwrap();

        let cache = CacheManager::new(&cache_dir, CachePolicy::default());
        let k = key(&["scalar"], "1970-01-01");
        cache.store(&k, &entry(&k)).unwrap();

        for server in ["http://..", "..", "", ".", "http://", "../user-files"] {
            cache.clear(&CacheScope::Server(server.to_string())).unwrap();
            for dataset in ["..", ".", "", "../../user-files"] {
                cache
                    .clear(&CacheScope::Dataset {
                        server: server.to_string(),
                        dataset: dataset.to_string(),
                    })
                    .unwrap();
            }
        }
        cache
            .clear(&CacheScope::Dataset {
                server: SERVER.to_string(),
                dataset: "..".to_string(),
            })
            .unwrap();

        assert!(sibling.join("important.txt").exists());
        assert!(cache_dir.join("notes.txt").exists());
        assert!(cache.entry_path(&k).exists());
    }

    #[test]
    fn lookalike_scopes_do_not_share_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path(), CachePolicy::default());
        let range = TimeRange::parse("1970-01-01", "1970-01-02").unwrap();
        let slash = CacheKey::new(SERVER, "x/y", &["scalar"], &range, Format::Csv);
        let underscore = CacheKey::new(SERVER, "x_y", &["scalar"], &range, Format::Csv);
        let secure = CacheKey::new(
            "https://hapi-server.org/servers/TestData/hapi",
            "dataset1",
            &["scalar"],
            &range,
            Format::Csv,
        );
        let plain = CacheKey::new(SERVER, "dataset1", &["scalar"], &range, Format::Csv);
        for k in [&slash, &underscore, &secure, &plain] {
            cache.store(k, &entry(k)).unwrap();
        }

        cache
            .clear(&CacheScope::Dataset {
                server: SERVER.to_string(),
                dataset: "x/y".to_string(),
            })
            .unwrap();
        assert!(!cache.entry_path(&slash).exists());
        assert!(cache.entry_path(&underscore).exists());

        cache
            .clear(&CacheScope::Server(
                "https://hapi-server.org/servers/TestData/hapi".to_string(),
            ))
            .unwrap();
        assert!(!cache.entry_path(&secure).exists());
        assert!(cache.entry_path(&plain).exists());
    }

    #[test]
    fn acquire_serializes_same_key() {
        let cache = Arc::new(CacheManager::new(
            std::env::temp_dir().join("unused-hapi-cache"),
            CachePolicy::default(),
        ));
        let k = key(&["scalar"], "1970-01-01");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let k = k.clone();
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    let _guard = cache.acquire(&k);
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        let other = key(&["Time"], "1970-01-01");
        let _a = cache.acquire(&k);
        let _b = cache.acquire(&other);
    }
}
