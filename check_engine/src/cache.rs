//! Sample-collection memoisation cache (§4.10), generalising the file-
//! content-hash cache pattern ("content + config match ⇒ reuse") from
//! "file content → diagnostics" to "provider+resource_model+config →
//! sample `ResourceCollection`" (§5: "The sample ResourceCollection used
//! during generation may be fetched once per (provider, resource_model)
//! and memoised").
//!
//! Cache concurrency is handled via atomic writes (temp file + rename).
//! Last writer wins; no locking. A corrupt cache file is logged, deleted,
//! and rebuilt rather than surfaced as an error — the cache is a
//! performance optimisation, never a correctness requirement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::resource::ResourceCollection;

/// Cache format version.
const CACHE_VERSION: &str = "1";

/// A cache key: the sample collection is scoped to one provider, one
/// resource model, and the config hash in effect when it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleCacheKey {
    pub provider: String,
    pub resource_model: String,
}

impl SampleCacheKey {
    #[must_use]
    pub fn new(provider: impl Into<String>, resource_model: impl Into<String>) -> Self {
        Self { provider: provider.into(), resource_model: resource_model.into() }
    }

    fn as_map_key(&self) -> String {
        format!("{}::{}", self.provider, self.resource_model)
    }
}

/// The on-disk cache file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    version: String,
    config_hash: String,
    entries: HashMap<String, ResourceCollection>,
}

/// An in-memory, optionally disk-persisted cache of sample
/// `ResourceCollection`s keyed by `(provider, resource_model)`, scoped to
/// one `config_hash`.
pub struct SampleCache {
    entries: HashMap<String, ResourceCollection>,
    config_hash: String,
    cache_path: Option<PathBuf>,
    enabled: bool,
}

impl SampleCache {
    /// Create a new cache, loading from disk if a path is configured and
    /// its config hash matches.
    #[must_use]
    pub fn new(root: &Path, config: &CacheConfig, config_hash: String) -> Self {
        if !config.enabled {
            return Self { entries: HashMap::new(), config_hash, cache_path: None, enabled: false };
        }

        let cache_path = config.path.as_ref().map(|p| root.join(p));
        let entries = cache_path.as_deref().map_or_else(HashMap::new, |p| load_cache_file(p, &config_hash));

        Self { entries, config_hash, cache_path, enabled: true }
    }

    /// An in-memory-only cache with no disk persistence, for tests and
    /// single-process runs.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { entries: HashMap::new(), config_hash: String::new(), cache_path: None, enabled: true }
    }

    #[must_use]
    pub fn get(&self, key: &SampleCacheKey) -> Option<&ResourceCollection> {
        if !self.enabled {
            return None;
        }
        self.entries.get(&key.as_map_key())
    }

    pub fn put(&mut self, key: &SampleCacheKey, collection: ResourceCollection) {
        if !self.enabled {
            return;
        }
        self.entries.insert(key.as_map_key(), collection);
    }

    /// Write the cache to disk atomically via temp-file + rename. A no-op
    /// if the cache is disabled or has no configured path.
    pub fn flush(&self) {
        let Some(ref cache_path) = self.cache_path else { return };
        if !self.enabled {
            return;
        }

        let cache_file = CacheFile { version: CACHE_VERSION.to_owned(), config_hash: self.config_hash.clone(), entries: self.entries.clone() };

        let json = match serde_json::to_string_pretty(&cache_file) {
            Ok(j) => j,
            Err(e) => {
                log::warn!("failed to serialize sample cache: {e}");
                return;
            }
        };

        if let Some(parent) = cache_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("failed to create sample cache directory: {e}");
                return;
            }
        }

        let pid = std::process::id();
        let tmp_path = cache_path.with_extension(format!("json.tmp.{pid}"));

        if let Err(e) = std::fs::write(&tmp_path, &json) {
            log::warn!("failed to write sample cache temp file: {e}");
            return;
        }

        if let Err(e) = std::fs::rename(&tmp_path, cache_path) {
            log::warn!("failed to rename sample cache file: {e}");
            let _ = std::fs::remove_file(&tmp_path);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Load the cache file from disk, validating the format version and
/// config hash. Returns an empty map on any mismatch, corruption, or I/O
/// failure — the caller simply refetches and repopulates.
fn load_cache_file(cache_path: &Path, config_hash: &str) -> HashMap<String, ResourceCollection> {
    if !cache_path.is_file() {
        return HashMap::new();
    }

    let content = match std::fs::read_to_string(cache_path) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("failed to read sample cache file: {e}");
            return HashMap::new();
        }
    };

    let cache_file: CacheFile = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("corrupt sample cache file ({e}); deleting and rebuilding");
            let _ = std::fs::remove_file(cache_path);
            return HashMap::new();
        }
    };

    if cache_file.version != CACHE_VERSION {
        log::info!("sample cache format version mismatch ({} != {CACHE_VERSION}); invalidating", cache_file.version);
        return HashMap::new();
    }

    if cache_file.config_hash != config_hash {
        log::info!("sample cache config hash mismatch; invalidating entire cache");
        return HashMap::new();
    }

    cache_file.entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use serde_json::json;

    fn collection() -> ResourceCollection {
        let resource = Resource::new("r1", "con_mon_v2.mappings.aws.S3Bucket", "aws", json!({"encrypted": true}));
        ResourceCollection::new("con_mon_v2.mappings.aws.S3Bucket", "aws", vec![resource])
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig { enabled: false, path: None };
        let mut cache = SampleCache::new(dir.path(), &config, "hash1".to_owned());
        let key = SampleCacheKey::new("aws", "S3Bucket");
        cache.put(&key, collection());
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_in_memory_put_and_get() {
        let mut cache = SampleCache::in_memory();
        let key = SampleCacheKey::new("aws", "S3Bucket");
        assert!(cache.get(&key).is_none());
        cache.put(&key, collection());
        assert_eq!(cache.get(&key).unwrap().total_count, 1);
    }

    #[test]
    fn test_distinct_keys_do_not_collide() {
        let mut cache = SampleCache::in_memory();
        cache.put(&SampleCacheKey::new("aws", "S3Bucket"), collection());
        assert!(cache.get(&SampleCacheKey::new("github", "S3Bucket")).is_none());
        assert!(cache.get(&SampleCacheKey::new("aws", "IamUser")).is_none());
    }

    #[test]
    fn test_flush_and_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig { enabled: true, path: Some("sample_cache.json".to_owned()) };
        let mut cache = SampleCache::new(dir.path(), &config, "hash1".to_owned());
        let key = SampleCacheKey::new("aws", "S3Bucket");
        cache.put(&key, collection());
        cache.flush();

        let reloaded = SampleCache::new(dir.path(), &config, "hash1".to_owned());
        assert_eq!(reloaded.get(&key).unwrap().total_count, 1);
    }

    #[test]
    fn test_config_hash_mismatch_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig { enabled: true, path: Some("sample_cache.json".to_owned()) };
        let mut cache = SampleCache::new(dir.path(), &config, "hash1".to_owned());
        let key = SampleCacheKey::new("aws", "S3Bucket");
        cache.put(&key, collection());
        cache.flush();

        let reloaded = SampleCache::new(dir.path(), &config, "hash2".to_owned());
        assert!(reloaded.get(&key).is_none());
    }

    #[test]
    fn test_corrupt_cache_file_recovers_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample_cache.json"), "not valid json{{{").unwrap();
        let config = CacheConfig { enabled: true, path: Some("sample_cache.json".to_owned()) };
        let cache = SampleCache::new(dir.path(), &config, "hash1".to_owned());
        assert!(cache.get(&SampleCacheKey::new("aws", "S3Bucket")).is_none());
    }

    #[test]
    fn test_clear_removes_entries() {
        let mut cache = SampleCache::in_memory();
        let key = SampleCacheKey::new("aws", "S3Bucket");
        cache.put(&key, collection());
        cache.clear();
        assert!(cache.get(&key).is_none());
    }
}
