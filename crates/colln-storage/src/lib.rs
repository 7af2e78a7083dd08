//! Result cache, dump-directory allocation and atomic file output for the collector.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use colln_core::{FILE_DATE_FORMAT, FILE_TIME_NANO_FORMAT};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "colln-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("encoding cache record for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decoding cache record for {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache record for {key} is {size} bytes, limit is {max}")]
    RecordTooLarge { key: String, size: usize, max: usize },
    #[error("cache shard lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_records: usize,
    pub max_record_size: usize,
    pub shards: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_records: 512,
            max_record_size: 512 * 1024,
            shards: 48,
            ttl: Duration::from_secs(180),
        }
    }
}

#[derive(Debug)]
struct CacheRecord {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// Capacity-bounded, expiring, sharded store of serialized records.
///
/// A miss (`Ok(None)`) is distinct from a failure (`Err`): evicted and expired
/// entries are plain misses.
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    per_shard: usize,
    shards: Vec<Mutex<HashMap<String, CacheRecord>>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        let per_shard = config.max_records.div_ceil(shard_count).max(1);
        let shards = (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            config,
            per_shard,
            shards,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, CacheRecord>> {
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let index = (u64::from_be_bytes(head) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let bytes = {
            let mut shard = self.shard_for(key).lock().map_err(|_| CacheError::Poisoned)?;
            match shard.get(key) {
                Some(record) if record.expires_at > Instant::now() => record.bytes.clone(),
                Some(_) => {
                    shard.remove(key);
                    return Ok(None);
                }
                None => return Ok(None),
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Decode {
                key: key.to_string(),
                source,
            })
    }

    /// Stores `value` for `ttl`. `None` has nothing worth caching and is a no-op.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: Option<&T>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let Some(value) = value else {
            return Ok(());
        };

        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        if bytes.len() > self.config.max_record_size {
            return Err(CacheError::RecordTooLarge {
                key: key.to_string(),
                size: bytes.len(),
                max: self.config.max_record_size,
            });
        }

        let mut shard = self.shard_for(key).lock().map_err(|_| CacheError::Poisoned)?;
        let now = Instant::now();
        if !shard.contains_key(key) && shard.len() >= self.per_shard {
            shard.retain(|_, record| record.expires_at > now);
            if shard.len() >= self.per_shard {
                let victim = shard
                    .iter()
                    .min_by_key(|(_, record)| record.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    debug!(evicted = %victim, "cache shard full");
                    shard.remove(&victim);
                }
            }
        }
        shard.insert(
            key.to_string(),
            CacheRecord {
                bytes,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    /// Number of stored records, expired ones included until they are touched.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().map(|s| s.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache key for an article URL: scheme, host and path. Query and fragment
/// carry per-impression tracking and are dropped.
pub fn canonical_key(raw_url: &str) -> Result<String, CacheError> {
    let url = Url::parse(raw_url.trim()).map_err(|err| CacheError::InvalidUrl {
        url: raw_url.to_string(),
        message: err.to_string(),
    })?;
    let host = url.host_str().ok_or_else(|| CacheError::InvalidUrl {
        url: raw_url.to_string(),
        message: "missing host".to_string(),
    })?;

    let mut key = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        key.push_str(&format!(":{port}"));
    }
    key.push_str(url.path());
    Ok(key)
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Capture location for one list page: `root/<YYYYMMDD>/<source>` with file
/// names prefixed by the capture time at nanosecond precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpDirectory {
    source: String,
    dump_time: DateTime<FixedOffset>,
    path: PathBuf,
    prefix: String,
}

impl DumpDirectory {
    pub fn allocate(root: impl AsRef<Path>, source: &str, instant: DateTime<FixedOffset>) -> Self {
        let path = root
            .as_ref()
            .join(instant.format(FILE_DATE_FORMAT).to_string())
            .join(source);
        Self {
            source: source.to_string(),
            dump_time: instant,
            path,
            prefix: instant.format(FILE_TIME_NANO_FORMAT).to_string(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dump_time(&self) -> DateTime<FixedOffset> {
        self.dump_time
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn full_html(&self) -> PathBuf {
        self.path.join(format!("{}.00.html", self.prefix))
    }

    pub fn full_screenshot(&self) -> PathBuf {
        self.path.join(format!("{}.00.jpg", self.prefix))
    }

    pub fn tab_screenshot(&self, tab: u32) -> PathBuf {
        self.path.join(format!("{}.tab.{:02}.jpg", self.prefix, tab))
    }

    /// Creates the directory tree if absent. Idempotent.
    pub fn init(&self) -> Result<(), StorageError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => return Err(StorageError::NotADirectory(self.path.clone())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::io("inspecting", &self.path, err)),
        }

        std::fs::create_dir_all(&self.path)
            .map_err(|err| StorageError::io("creating", &self.path, err))?;
        let meta = std::fs::metadata(&self.path)
            .map_err(|err| StorageError::io("inspecting", &self.path, err))?;
        if !meta.is_dir() {
            return Err(StorageError::NotADirectory(self.path.clone()));
        }
        Ok(())
    }
}

/// Creates `path` if needed and proves it writable with a probe file.
pub fn ensure_writable_dir(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(|err| StorageError::io("creating", path, err))?;
    let meta = std::fs::metadata(path).map_err(|err| StorageError::io("inspecting", path, err))?;
    if !meta.is_dir() {
        return Err(StorageError::NotADirectory(path.to_path_buf()));
    }

    let probe = path.join(format!(".colln-probe-{}", Uuid::new_v4()));
    std::fs::File::create(&probe).map_err(|err| StorageError::io("writing to", path, err))?;
    let _ = std::fs::remove_file(&probe);
    debug!(path = %path.display(), "directory is writable");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Writes `bytes` to `path` through a temp file and rename, creating parents.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    info!(path = %path.display(), bytes = bytes.len(), "wrote file");
    Ok(StoredFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}
