use serde_derive::{Deserialize, Serialize};

use crate::chunk::global::DEFAULT_MAX_OPEN_FILES;
use crate::error::{CResult, Error};

/// The recognized configuration surface, using the dotted option names of
/// the persisted configuration format. Every option is optional; unset
/// options take their documented defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Whether point reads go through the bounded read cache.
    #[serde(rename = "cache.enabled")]
    pub cache_enabled: Option<bool>,

    /// Read cache capacity in entries.
    #[serde(rename = "cache.maxSize")]
    pub cache_max_size: Option<usize>,

    /// Whether cached values may be handed out shared instead of deep-copied
    /// per lookup.
    #[serde(rename = "cache.assumeImmutable")]
    pub cache_assume_immutable: Option<bool>,

    /// Whether index query results are cached per branch.
    #[serde(rename = "queryCache.enabled")]
    pub query_cache_enabled: Option<bool>,

    /// Query cache capacity in entries per branch.
    #[serde(rename = "queryCache.maxSize")]
    pub query_cache_max_size: Option<usize>,

    /// Advisory backend cache size in bytes. Accepted for compatibility;
    /// the log-structured chunk files have no block cache of their own.
    #[serde(rename = "storage.backendCacheBytes")]
    pub storage_backend_cache_bytes: Option<u64>,

    /// Bound on concurrently open chunk files.
    #[serde(rename = "branches.maxOpenFiles")]
    pub branches_max_open_files: Option<usize>,

    /// Head chunk capacity in rows: a commit finding the head at or above
    /// this rolls the chunk over first. Unset means heads grow unbounded
    /// until an explicit rollover.
    #[serde(rename = "storage.chunkRolloverRows")]
    pub storage_chunk_rollover_rows: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_enabled: None,
            cache_max_size: None,
            cache_assume_immutable: None,
            query_cache_enabled: None,
            query_cache_max_size: None,
            storage_backend_cache_bytes: None,
            branches_max_open_files: None,
            storage_chunk_rollover_rows: None,
        }
    }
}

impl Config {
    /// Parses a configuration document, rejecting unknown option names.
    pub fn from_json(raw: &str) -> CResult<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CResult<()> {
        if self.branches_max_open_files == Some(0) {
            return Err(Error::InvalidArgument(
                "branches.maxOpenFiles must be at least 1".to_string(),
            ));
        }
        if self.cache_max_size == Some(0) {
            return Err(Error::InvalidArgument("cache.maxSize must be at least 1".to_string()));
        }
        if self.query_cache_max_size == Some(0) {
            return Err(Error::InvalidArgument(
                "queryCache.maxSize must be at least 1".to_string(),
            ));
        }
        if self.storage_chunk_rollover_rows == Some(0) {
            return Err(Error::InvalidArgument(
                "storage.chunkRolloverRows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.unwrap_or(false)
    }

    pub fn cache_max_size(&self) -> usize {
        self.cache_max_size.unwrap_or(100_000)
    }

    pub fn cache_assume_immutable(&self) -> bool {
        self.cache_assume_immutable.unwrap_or(false)
    }

    pub fn query_cache_enabled(&self) -> bool {
        self.query_cache_enabled.unwrap_or(false)
    }

    pub fn query_cache_max_size(&self) -> usize {
        self.query_cache_max_size.unwrap_or(1_024)
    }

    pub fn branches_max_open_files(&self) -> usize {
        self.branches_max_open_files.unwrap_or(DEFAULT_MAX_OPEN_FILES)
    }

    pub fn storage_chunk_rollover_rows(&self) -> Option<u64> {
        self.storage_chunk_rollover_rows
    }
}
