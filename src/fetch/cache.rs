//! On-disk cache of fetched source bodies.
//!
//! Each URL maps to `<sha256(url)>.body` plus a `<sha256(url)>.meta` JSON
//! file recording when the body was fetched and its ETag. Bodies are stored
//! decompressed and replaced atomically.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::Result;

/// Metadata stored next to a cached body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheMetadata {
    pub url: String,
    #[serde(with = "system_time_serde")]
    pub fetched_at: Option<SystemTime>,
    pub etag: Option<String>,
}

mod system_time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => {
                let duration = t.duration_since(UNIX_EPOCH).unwrap_or_default();
                Some(duration.as_secs()).serialize(serializer)
            }
            None => None::<u64>.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(|s| UNIX_EPOCH + Duration::from_secs(s)))
    }
}

impl CacheMetadata {
    /// Age of the entry; entries without a timestamp are infinitely old.
    pub fn age(&self) -> Duration {
        match self.fetched_at {
            None => Duration::MAX,
            Some(at) => SystemTime::now().duration_since(at).unwrap_or_default(),
        }
    }

    /// Whether the entry is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// A cached body and its metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: CacheMetadata,
    pub body: Vec<u8>,
}

/// Counts reported by [`FetchCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Disk cache keyed by the SHA-256 of the source URL.
#[derive(Debug, Clone)]
pub struct FetchCache {
    dir: PathBuf,
    ttl: Duration,
}

impl FetchCache {
    /// Open (and create) a cache directory.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cache key for a URL.
    pub fn key(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.body", key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", key))
    }

    /// Load the entry for `url`, fresh or not.
    ///
    /// A missing, unreadable or mismatched entry is a miss.
    pub fn lookup(&self, url: &str) -> Option<CacheEntry> {
        let key = Self::key(url);
        let meta: CacheMetadata = fs::read_to_string(self.meta_path(&key))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())?;
        if meta.url != url {
            log::warn!("cache entry {} belongs to {}, ignoring", key, meta.url);
            return None;
        }
        let body = fs::read(self.body_path(&key)).ok()?;
        Some(CacheEntry { meta, body })
    }

    /// Store a freshly downloaded body.
    pub fn store(&self, url: &str, body: &[u8], etag: Option<String>) -> Result<()> {
        let key = Self::key(url);
        let meta = CacheMetadata {
            url: url.to_string(),
            fetched_at: Some(SystemTime::now()),
            etag,
        };
        write_atomic(&self.body_path(&key), body)?;
        write_atomic(&self.meta_path(&key), serde_json::to_string_pretty(&meta)?.as_bytes())?;
        log::debug!("cached {} ({} bytes)", url, body.len());
        Ok(())
    }

    /// Mark an entry as fetched now after a successful revalidation.
    pub fn touch(&self, url: &str, etag: Option<String>) -> Result<()> {
        let key = Self::key(url);
        let Some(mut entry) = self.lookup(url) else {
            return Ok(());
        };
        entry.meta.fetched_at = Some(SystemTime::now());
        if etag.is_some() {
            entry.meta.etag = etag;
        }
        write_atomic(
            &self.meta_path(&key),
            serde_json::to_string_pretty(&entry.meta)?.as_bytes(),
        )
    }

    /// Remove entries older than `max_age`, and bodies whose metadata is
    /// gone. Returns the number of entries removed.
    pub fn purge_older_than(&self, max_age: Duration) -> Result<usize> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            paths.push(entry?.path());
        }

        let mut removed = 0;
        for path in paths.iter().filter(|p| has_extension(p, "meta")) {
            let meta: CacheMetadata = fs::read_to_string(path)
                .ok()
                .and_then(|c| serde_json::from_str(&c).ok())
                .unwrap_or_default();
            if meta.age() >= max_age {
                remove_if_present(&path.with_extension("body"));
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        for path in paths.iter().filter(|p| has_extension(p, "body")) {
            if path.exists() && !path.with_extension("meta").exists() {
                log::debug!("removing orphaned cache body {:?}", path);
                remove_if_present(path);
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("purged {} stale cache entries from {:?}", removed, self.dir);
        }
        Ok(removed)
    }

    /// Number of cached bodies and their total size.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("body") {
                stats.entries += 1;
                stats.bytes += entry.metadata()?.len();
            }
        }
        Ok(stats)
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove cache file {:?}: {}", path, e),
    }
}

/// Write to a temp file in the same directory, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    temp_file.write_all(data)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
