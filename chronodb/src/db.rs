//! The owning store instance and its public API.
//!
//! A [`ChronoDb`] owns one store directory: the branch registry and chunk
//! handle pool, the index backend, and the optional caches. Instances on
//! different directories are fully independent; an exclusive lock file keeps
//! two processes off the same directory.
//!
//! Reads resolve the branch chain first: a read at `(branch, T)` consults
//! the branch itself, then each origin with the timestamp capped at the fork
//! point, so forked branches see their origin's history without copying it.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::FileExt;

use crate::branch::BranchInfo;
use crate::cache::{CacheStats, QueryCache, ReadCache};
use crate::chunk::global::GlobalChunkManager;
use crate::codec::{temporal_key, value};
use crate::commit::{CommitOutcome, CommitPipeline};
use crate::config::Config;
use crate::error::{CResult, Error};
use crate::index::backend::{IndexBackend, NewDocument};
use crate::index::document::SearchSpec;
use crate::index::extractor::{ExtractorKind, ExtractorRegistry};
use crate::matrix::{HistoryIter, ModificationsIter, RowState, TemporalMatrix};
use crate::{
    validate_keyspace, SortOrder, Timestamp, COMMIT_KEYSPACE, TIMESTAMP_MAX,
};

pub use crate::commit::Mutation;

/// Aggregated store status.
#[derive(Clone, Debug)]
pub struct DbStatus {
    pub branches: usize,
    pub open_chunk_handles: usize,
    pub indices: usize,
    pub read_cache: Option<CacheStats>,
    pub query_cache: Option<CacheStats>,
}

/// A ChronoDB store instance.
pub struct ChronoDb {
    root: PathBuf,
    config: Config,
    gcm: Arc<GlobalChunkManager>,
    index: Arc<IndexBackend>,
    pipeline: CommitPipeline,
    registry: Arc<ExtractorRegistry>,
    read_cache: Option<ReadCache>,
    query_cache: Option<QueryCache>,
    /// Exclusive lock on the store directory, held for the instance's
    /// lifetime.
    _lock_file: std::fs::File,
}

impl ChronoDb {
    /// Opens (or creates) a store at `root`, recovering branches, chunk
    /// sequences, and commit marks.
    pub fn open(root: impl AsRef<Path>, config: Config) -> CResult<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(root.join("LOCK"))?;
        lock_file.try_lock_exclusive()?;

        let gcm =
            GlobalChunkManager::open(&root.join("branches"), config.branches_max_open_files())?;
        let registry = Arc::new(ExtractorRegistry::new());
        let index =
            Arc::new(IndexBackend::open(&root.join("temporalIndex_master"), registry.clone())?);
        let pipeline = CommitPipeline::new(
            gcm.clone(),
            index.clone(),
            config.storage_chunk_rollover_rows(),
        );

        let read_cache = if config.cache_enabled() {
            Some(ReadCache::new(config.cache_max_size(), config.cache_assume_immutable())?)
        } else {
            None
        };
        let query_cache = if config.query_cache_enabled() {
            Some(QueryCache::new(config.query_cache_max_size())?)
        } else {
            None
        };

        log::info!(
            "Opened ChronoDB store at {} with {} branches",
            root.display(),
            gcm.branch_names().len()
        );
        Ok(Self {
            root,
            config,
            gcm,
            index,
            pipeline,
            registry,
            read_cache,
            query_cache,
            _lock_file: lock_file,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The registry named index extractors resolve through. Custom
    /// extractors must be registered here in every process that opens the
    /// store.
    pub fn extractor_registry(&self) -> &Arc<ExtractorRegistry> {
        &self.registry
    }

    // --- Reads ---------------------------------------------------------

    /// The newest visible commit timestamp on a branch; 0 for a root branch
    /// with no commits.
    pub fn now(&self, branch: &str) -> CResult<Timestamp> {
        Ok(self.gcm.branch(branch)?.now())
    }

    /// The live value of `(keyspace, key)` at `T`, or None if the key is
    /// absent or deleted at `T`.
    pub fn get(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        t: Timestamp,
    ) -> CResult<Option<Vec<u8>>> {
        Ok(self.get_shared(branch, keyspace, key, t)?.map(|value| value.as_ref().clone()))
    }

    /// Like get(), but hands out the cached value shared when the read cache
    /// runs with `cache.assumeImmutable`.
    pub fn get_shared(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        t: Timestamp,
    ) -> CResult<Option<Arc<Vec<u8>>>> {
        validate_read_args(keyspace, key, t)?;
        if let Some(cache) = &self.read_cache {
            if let Some(row) = cache.get(branch, keyspace, key, t) {
                return Ok(row);
            }
        }
        let result = self.get_uncached(branch, keyspace, key, t)?;
        if let Some(cache) = &self.read_cache {
            cache.insert(branch, keyspace, key, t, result.as_deref());
        }
        Ok(result.map(Arc::new))
    }

    fn get_uncached(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        t: Timestamp,
    ) -> CResult<Option<Vec<u8>>> {
        for (chain_branch, cap) in self.gcm.resolve_chain(branch, t)? {
            if chain_branch.chunks().first_valid_from() > cap {
                continue; // no data at or below the capped timestamp
            }
            let matrix = TemporalMatrix::new(self.gcm.clone(), chain_branch);
            match matrix.get(keyspace, key, cap)? {
                RowState::Value(value) => return Ok(Some(value)),
                RowState::Tombstone => return Ok(None),
                RowState::Absent => {}
            }
        }
        Ok(None)
    }

    /// The commit timestamps of a key up to `T`, across the branch chain, as
    /// a lazy single-pass sequence.
    pub fn history(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        t: Timestamp,
        order: SortOrder,
    ) -> CResult<ChainHistory> {
        validate_read_args(keyspace, key, t)?;
        let mut chain = self.gcm.resolve_chain(branch, t)?;
        if order == SortOrder::Ascending {
            // Origin times precede fork times; ascending walks the chain
            // from the root down.
            chain.reverse();
        }
        let mut iters = VecDeque::new();
        for (chain_branch, cap) in chain {
            if chain_branch.chunks().first_valid_from() > cap {
                continue;
            }
            let matrix = TemporalMatrix::new(self.gcm.clone(), chain_branch);
            iters.push_back(matrix.history(keyspace, key, cap, order)?);
        }
        Ok(ChainHistory { iters })
    }

    /// Every base-data modification on the branch itself within `[lo, hi]`,
    /// ascending by timestamp. Origin branches are not consulted: this feeds
    /// reindexing and change feeds over a branch's own chunks.
    pub fn modifications_between(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
    ) -> CResult<ModificationsIter> {
        validate_window(lo, hi)?;
        let branch = self.gcm.branch(branch)?;
        TemporalMatrix::new(self.gcm.clone(), branch).modifications_between(lo, hi)
    }

    /// Counts the branch's own modifications within `[lo, hi]`.
    pub fn count_modifications_between(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
    ) -> CResult<u64> {
        validate_window(lo, hi)?;
        let branch = self.gcm.branch(branch)?;
        TemporalMatrix::new(self.gcm.clone(), branch).count_between(lo, hi)
    }

    /// The branch's own commit timestamps within `[lo, hi]`, lazily.
    pub fn commit_timestamps_between(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
        order: SortOrder,
    ) -> CResult<CommitTimestamps> {
        validate_window(lo, hi)?;
        let branch = self.gcm.branch(branch)?;
        let matrix = TemporalMatrix::new(self.gcm.clone(), branch);
        Ok(CommitTimestamps { inner: matrix.history(COMMIT_KEYSPACE, "", hi, order)?, lo })
    }

    /// The metadata payload of the commit at exactly `(branch, t)`:
    /// `None` if no commit happened at `t`, `Some(None)` for a commit
    /// without payload.
    pub fn commit_metadata(
        &self,
        branch: &str,
        t: Timestamp,
    ) -> CResult<Option<Option<Vec<u8>>>> {
        let branch = self.gcm.branch(branch)?;
        if t == 0 || t > TIMESTAMP_MAX {
            return Ok(None);
        }
        let chunk = match branch.chunks().chunk_for_timestamp(t) {
            Ok(chunk) => chunk,
            Err(Error::ChunkMissing(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let txn = self.gcm.open_bogus_transaction(&chunk)?;
        let row = txn.get(&temporal_key::encode(COMMIT_KEYSPACE, "", t)?)?;
        match row {
            Some(row) => {
                let payload_bytes = value::row_payload(&row)?.ok_or_else(|| {
                    Error::Internal(format!("commit row at {} is a tombstone", t))
                })?;
                Ok(Some(value::decode_commit_payload(payload_bytes)?))
            }
            None => Ok(None),
        }
    }

    /// The branch's own commits within `[lo, hi]` with their metadata
    /// payloads, lazily.
    pub fn commit_metadata_between(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
        order: SortOrder,
    ) -> CResult<CommitMetadataIter> {
        let timestamps = self.commit_timestamps_between(branch, lo, hi, order)?;
        let branch = self.gcm.branch(branch)?;
        Ok(CommitMetadataIter {
            gcm: self.gcm.clone(),
            branch,
            timestamps,
            remaining: None,
        })
    }

    /// One page of the branch's commits within `[lo, hi]`: pages of
    /// `page_size` commits, `page_index` counting from 0.
    pub fn commit_metadata_paged(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
        page_size: usize,
        page_index: usize,
        order: SortOrder,
    ) -> CResult<CommitMetadataIter> {
        if page_size == 0 {
            return Err(Error::InvalidArgument("page size must be at least 1".to_string()));
        }
        let mut iter = self.commit_metadata_between(branch, lo, hi, order)?;
        for _ in 0..page_size.saturating_mul(page_index) {
            if iter.timestamps.next().transpose()?.is_none() {
                break;
            }
        }
        iter.remaining = Some(page_size);
        Ok(iter)
    }

    // --- Writes --------------------------------------------------------

    /// Commits a batch of mutations on a branch, with an optional opaque
    /// metadata payload, returning the commit timestamp. Visibility is
    /// all-or-nothing: a reader at the returned timestamp sees the entire
    /// commit, base data and index alike.
    ///
    /// `IndexWriteFailed` means the base data is durable and visible but the
    /// index writer failed; the affected indices are dirty until rebuilt.
    pub fn commit(
        &self,
        branch: &str,
        mutations: Vec<Mutation>,
        payload: Option<&[u8]>,
    ) -> CResult<Timestamp> {
        let outcome = self.pipeline.commit(branch, mutations, payload)?;
        self.invalidate_after_commit(branch, &outcome);
        if let Some(failure) = outcome.index_failure {
            return Err(Error::IndexWriteFailed(failure));
        }
        Ok(outcome.t)
    }

    fn invalidate_after_commit(&self, branch: &str, outcome: &CommitOutcome) {
        if let Some(cache) = &self.read_cache {
            for (keyspace, key) in &outcome.touched {
                cache.invalidate_row(branch, keyspace, key);
            }
        }
        if let Some(cache) = &self.query_cache {
            // The committed branch and every branch descending from it; a
            // commit on a child never touches its ancestors' results.
            cache.invalidate_branches(&self.self_and_descendants(branch));
        }
    }

    fn self_and_descendants(&self, branch: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for name in self.gcm.branch_names() {
            let mut current = name.clone();
            loop {
                if current == branch {
                    affected.push(name.clone());
                    break;
                }
                match self.gcm.branch(&current).ok().and_then(|b| {
                    b.origin().map(|(origin, _)| origin.clone())
                }) {
                    Some(origin) => current = origin,
                    None => break,
                }
            }
        }
        affected
    }

    /// Seals the branch's head chunk right after its newest commit and opens
    /// an empty successor.
    pub fn rollover(&self, branch: &str) -> CResult<()> {
        let branch = self.gcm.branch(branch)?;
        let _guard = branch
            .commit_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = branch.now();
        let head = branch.chunks().head();
        if now < head.valid_from() {
            return Err(Error::InvalidArgument(format!(
                "head chunk of branch {} is empty; nothing to roll over",
                branch.name()
            )));
        }
        let txn = self.gcm.open_bogus_transaction(&head)?;
        let rows = txn.underlying_key_count()?;
        drop(txn);
        branch.chunks().perform_rollover(now, rows)?;
        Ok(())
    }

    // --- Branches ------------------------------------------------------

    /// Forks a new branch off `origin` at timestamp `at` (which must not
    /// exceed the origin's newest commit). The new branch sees the origin's
    /// state up to `at` and diverges from there.
    pub fn create_branch(&self, name: &str, origin: &str, at: Timestamp) -> CResult<()> {
        self.gcm.create_branch(name, Some((origin, at)))?;
        Ok(())
    }

    /// All branch names, sorted.
    pub fn branches(&self) -> Vec<String> {
        self.gcm.branch_names()
    }

    pub fn branch_info(&self, name: &str) -> CResult<BranchInfo> {
        Ok(self.gcm.branch(name)?.info())
    }

    // --- Indexing ------------------------------------------------------

    /// Registers a secondary index. If any branch already carries commits,
    /// the index starts dirty and must be rebuilt before use.
    pub fn register_index(&self, name: &str, kind: ExtractorKind) -> CResult<()> {
        let dirty = self.any_branch_has_commits();
        self.index.register(name, kind, dirty)
    }

    fn any_branch_has_commits(&self) -> bool {
        self.gcm.branch_names().iter().any(|name| {
            self.gcm
                .branch(name)
                .map(|branch| branch.now() > branch.branching_timestamp().unwrap_or(0))
                .unwrap_or(false)
        })
    }

    /// Drops an index and its documents.
    pub fn drop_index(&self, name: &str) -> CResult<()> {
        self.index.drop_index(name)?;
        if let Some(cache) = &self.query_cache {
            cache.invalidate_branches(&self.branches());
        }
        Ok(())
    }

    pub fn index_names(&self) -> Vec<String> {
        self.index.index_names()
    }

    pub fn index_dirty(&self, name: &str) -> CResult<bool> {
        self.index.is_dirty(name)
    }

    /// Rebuilds one index from the base data of every branch and clears its
    /// dirty flag.
    pub fn rebuild_index(&self, name: &str) -> CResult<()> {
        self.index.kinds(name)?;

        let mut rebuilt: Vec<NewDocument> = Vec::new();
        for branch_name in self.gcm.branch_names() {
            let branch = self.gcm.branch(&branch_name)?;
            let matrix = TemporalMatrix::new(self.gcm.clone(), branch);
            let rows = matrix.rows_between(0, TIMESTAMP_MAX)?;

            // Group each key's versions, preserving ascending time order.
            let mut grouped: BTreeMap<(String, String), Vec<(Timestamp, Option<Vec<u8>>)>> =
                BTreeMap::new();
            for (t, keyspace, key, row_value) in rows {
                grouped.entry((keyspace, key)).or_default().push((t, row_value));
            }

            // Sweep each version sequence: values no longer produced get
            // their interval closed, fresh values open one.
            for ((keyspace, key), versions) in grouped {
                let mut open: BTreeMap<String, Timestamp> = BTreeMap::new();
                for (t, row_value) in versions {
                    let values = match &row_value {
                        Some(v) => self.index.extract(name, v)?,
                        None => BTreeSet::new(),
                    };
                    let stale: Vec<String> =
                        open.keys().filter(|v| !values.contains(*v)).cloned().collect();
                    for v in stale {
                        if let Some(from) = open.remove(&v) {
                            rebuilt.push(NewDocument {
                                branch: branch_name.clone(),
                                keyspace: keyspace.clone(),
                                key: key.clone(),
                                index: name.to_string(),
                                value: v,
                                valid_from: from,
                                valid_to: t,
                            });
                        }
                    }
                    for v in values {
                        open.entry(v).or_insert(t);
                    }
                }
                for (v, from) in open {
                    rebuilt.push(NewDocument {
                        branch: branch_name.clone(),
                        keyspace: keyspace.clone(),
                        key: key.clone(),
                        index: name.to_string(),
                        value: v,
                        valid_from: from,
                        valid_to: TIMESTAMP_MAX,
                    });
                }
            }
        }

        self.index.rebuild(name, rebuilt)?;
        if let Some(cache) = &self.query_cache {
            cache.invalidate_branches(&self.branches());
        }
        Ok(())
    }

    /// The keys of `(branch, keyspace)` whose indexed value at `T` satisfies
    /// the search spec, sorted. Ancestor branches answer for keys the branch
    /// has not re-written since its fork.
    pub fn query(
        &self,
        branch: &str,
        keyspace: &str,
        t: Timestamp,
        spec: &SearchSpec,
    ) -> CResult<Vec<String>> {
        validate_keyspace(keyspace)?;
        let fingerprint = spec.fingerprint();
        if let Some(cache) = &self.query_cache {
            if let Some(keys) = cache.get(branch, keyspace, t, &fingerprint) {
                return Ok(keys.as_ref().clone());
            }
        }

        let mut matches: BTreeSet<String> = BTreeSet::new();
        let mut shadowed: HashSet<String> = HashSet::new();
        for (chain_branch, cap) in self.gcm.resolve_chain(branch, t)? {
            for doc in self.index.get_matching(chain_branch.name(), keyspace, cap, spec)? {
                if !shadowed.contains(&doc.key) {
                    matches.insert(doc.key);
                }
            }
            // Keys this branch touched up to the cap shadow every ancestor:
            // the branch's own state answers for them, match or not.
            if chain_branch.chunks().first_valid_from() <= cap {
                let matrix = TemporalMatrix::new(self.gcm.clone(), chain_branch);
                for row in matrix.modifications_between(0, cap)? {
                    let (_, row_keyspace, row_key) = row?;
                    if row_keyspace == keyspace {
                        shadowed.insert(row_key);
                    }
                }
            }
        }

        let keys: Vec<String> = matches.into_iter().collect();
        if let Some(cache) = &self.query_cache {
            cache.insert(branch, keyspace, t, &fingerprint, Arc::new(keys.clone()));
        }
        Ok(keys)
    }

    // --- Operations ----------------------------------------------------

    pub fn status(&self) -> DbStatus {
        DbStatus {
            branches: self.gcm.branch_names().len(),
            open_chunk_handles: self.gcm.open_handle_count(),
            indices: self.index.index_names().len(),
            read_cache: self.read_cache.as_ref().map(|cache| cache.stats()),
            query_cache: self.query_cache.as_ref().map(|cache| cache.stats()),
        }
    }

    /// Closes every pooled chunk handle. The store stays usable; handles
    /// reopen on demand.
    pub fn shutdown(&self) {
        self.gcm.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn index_backend(&self) -> &Arc<IndexBackend> {
        &self.index
    }

    #[cfg(test)]
    pub(crate) fn chunk_manager(&self) -> &Arc<GlobalChunkManager> {
        &self.gcm
    }
}

fn validate_read_args(keyspace: &str, key: &str, t: Timestamp) -> CResult<()> {
    validate_keyspace(keyspace)?;
    if key.contains('\0') {
        return Err(Error::InvalidArgument("key must not contain NUL bytes".to_string()));
    }
    if t > TIMESTAMP_MAX {
        return Err(Error::InvalidArgument(format!(
            "timestamp {} exceeds the 63-bit range",
            t
        )));
    }
    Ok(())
}

fn validate_window(lo: Timestamp, hi: Timestamp) -> CResult<()> {
    if lo > hi {
        return Err(Error::InvalidArgument(format!("window [{}, {}] is inverted", lo, hi)));
    }
    if hi > TIMESTAMP_MAX {
        return Err(Error::InvalidArgument(format!(
            "timestamp {} exceeds the 63-bit range",
            hi
        )));
    }
    Ok(())
}

/// A key's history across the branch chain: per-branch lazy iterators,
/// concatenated. Time ranges of chain entries are disjoint, so plain
/// concatenation preserves the requested order.
pub struct ChainHistory {
    iters: VecDeque<HistoryIter>,
}

impl Iterator for ChainHistory {
    type Item = CResult<Timestamp>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let front = self.iters.front_mut()?;
            match front.next() {
                Some(item) => return Some(item),
                None => {
                    self.iters.pop_front();
                }
            }
        }
    }
}

/// The branch's own commit timestamps within a window, lazily.
pub struct CommitTimestamps {
    inner: HistoryIter,
    lo: Timestamp,
}

impl Iterator for CommitTimestamps {
    type Item = CResult<Timestamp>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next() {
                Some(Ok(t)) if t < self.lo => continue,
                other => return other,
            }
        }
    }
}

/// Commit timestamps paired with their metadata payloads, lazily.
pub struct CommitMetadataIter {
    gcm: Arc<GlobalChunkManager>,
    branch: Arc<crate::branch::Branch>,
    timestamps: CommitTimestamps,
    /// Page budget; None iterates the whole window.
    remaining: Option<usize>,
}

impl CommitMetadataIter {
    fn fetch(&self, t: Timestamp) -> CResult<Option<Vec<u8>>> {
        let chunk = self.branch.chunks().chunk_for_timestamp(t)?;
        let txn = self.gcm.open_bogus_transaction(&chunk)?;
        let row = txn
            .get(&temporal_key::encode(COMMIT_KEYSPACE, "", t)?)?
            .ok_or_else(|| Error::Internal(format!("commit row at {} disappeared", t)))?;
        let payload_bytes = value::row_payload(&row)?
            .ok_or_else(|| Error::Internal(format!("commit row at {} is a tombstone", t)))?;
        value::decode_commit_payload(payload_bytes)
    }
}

impl Iterator for CommitMetadataIter {
    type Item = CResult<(Timestamp, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        match self.timestamps.next()? {
            Ok(t) => Some(self.fetch(t).map(|payload| (t, payload))),
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::document::SearchCondition;
    use crate::MASTER;

    fn setup() -> CResult<(tempdir::TempDir, ChronoDb)> {
        setup_with(Config::default())
    }

    fn setup_with(config: Config) -> CResult<(tempdir::TempDir, ChronoDb)> {
        let dir = tempdir::TempDir::new("chronodb")?;
        let db = ChronoDb::open(dir.path(), config)?;
        Ok((dir, db))
    }

    #[test]
    /// An empty store: absent reads and a zero clock.
    fn empty_store() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert_eq!(db.get(MASTER, "ks", "k", 0)?, None);
        assert_eq!(db.now(MASTER)?, 0);
        assert_eq!(db.branches(), vec!["master".to_string()]);
        Ok(())
    }

    #[test]
    /// A single commit is visible at its timestamp and invisible before it.
    fn first_commit_visibility() -> CResult<()> {
        let (_dir, db) = setup()?;
        let t = db.commit(MASTER, vec![Mutation::put("ks", "a", b"x".to_vec())], None)?;
        assert_eq!(t, 1);
        assert_eq!(db.get(MASTER, "ks", "a", 1)?, Some(b"x".to_vec()));
        assert_eq!(db.get(MASTER, "ks", "a", 0)?, None);
        assert_eq!(
            db.history(MASTER, "ks", "a", 1, SortOrder::Descending)?
                .collect::<CResult<Vec<_>>>()?,
            vec![1]
        );
        Ok(())
    }

    #[test]
    /// Writes, updates, and deletes at successive timestamps; each snapshot
    /// keeps its own view, and history lists all versions.
    fn update_and_delete_history() -> CResult<()> {
        let (_dir, db) = setup()?;
        db.commit(MASTER, vec![Mutation::put("ks", "a", b"x".to_vec())], None)?;
        db.commit(MASTER, vec![Mutation::put("ks", "a", b"y".to_vec())], None)?;
        db.commit(MASTER, vec![Mutation::delete("ks", "a")], None)?;

        assert_eq!(db.get(MASTER, "ks", "a", 1)?, Some(b"x".to_vec()));
        assert_eq!(db.get(MASTER, "ks", "a", 2)?, Some(b"y".to_vec()));
        assert_eq!(db.get(MASTER, "ks", "a", 3)?, None);
        assert_eq!(
            db.history(MASTER, "ks", "a", 3, SortOrder::Descending)?
                .collect::<CResult<Vec<_>>>()?,
            vec![3, 2, 1]
        );

        // Unrelated commits leave earlier snapshots untouched.
        db.commit(MASTER, vec![Mutation::put("ks", "b", b"z".to_vec())], None)?;
        assert_eq!(db.get(MASTER, "ks", "a", 2)?, Some(b"y".to_vec()));
        Ok(())
    }

    #[test]
    /// Fork semantics: the child sees the origin's history below the fork,
    /// diverges above it, and never affects the origin.
    fn fork_fall_through() -> CResult<()> {
        let (_dir, db) = setup()?;
        for i in 1..=5 {
            db.commit(
                MASTER,
                vec![Mutation::put("ks", "a", format!("m{}", i).into_bytes())],
                None,
            )?;
        }
        db.create_branch("child", MASTER, 5)?;
        assert_eq!(db.now("child")?, 5);

        let t = db.commit("child", vec![Mutation::put("ks", "z", b"z".to_vec())], None)?;
        assert_eq!(t, 6);

        // The child's own write, and fall-through to master below the fork.
        assert_eq!(db.get("child", "ks", "z", 6)?, Some(b"z".to_vec()));
        assert_eq!(db.get("child", "ks", "a", 5)?, Some(b"m5".to_vec()));
        assert_eq!(db.get("child", "ks", "a", 6)?, Some(b"m5".to_vec()));
        assert_eq!(db.get("child", "ks", "a", 2)?, Some(b"m2".to_vec()));

        // Master is unaffected by child writes.
        assert_eq!(db.now(MASTER)?, 5);
        assert_eq!(db.get(MASTER, "ks", "z", 6)?, None);

        // A child write to a fallen-through key overrides it from there on.
        db.commit("child", vec![Mutation::put("ks", "a", b"c7".to_vec())], None)?;
        assert_eq!(db.get("child", "ks", "a", 7)?, Some(b"c7".to_vec()));
        assert_eq!(db.get("child", "ks", "a", 6)?, Some(b"m5".to_vec()));
        assert_eq!(db.get(MASTER, "ks", "a", 7)?, Some(b"m5".to_vec()));

        // History across the chain, both orders.
        assert_eq!(
            db.history("child", "ks", "a", 7, SortOrder::Descending)?
                .collect::<CResult<Vec<_>>>()?,
            vec![7, 5, 4, 3, 2, 1]
        );
        assert_eq!(
            db.history("child", "ks", "a", 7, SortOrder::Ascending)?
                .collect::<CResult<Vec<_>>>()?,
            vec![1, 2, 3, 4, 5, 7]
        );

        // Forking above the origin's clock is rejected.
        assert!(matches!(
            db.create_branch("eager", "child", 99),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    /// Commits and reads survive a close and reopen: chunk sequences and
    /// commit marks recover from disk.
    fn reopen_recovers_state() -> CResult<()> {
        let dir = tempdir::TempDir::new("chronodb")?;
        {
            let db = ChronoDb::open(dir.path(), Config::default())?;
            db.commit(MASTER, vec![Mutation::put("ks", "a", b"x".to_vec())], Some(b"first"))?;
            db.commit(MASTER, vec![Mutation::put("ks", "b", b"y".to_vec())], None)?;
            db.create_branch("child", MASTER, 2)?;
            db.commit("child", vec![Mutation::put("ks", "a", b"c".to_vec())], None)?;
            db.shutdown();
        }
        let db = ChronoDb::open(dir.path(), Config::default())?;
        assert_eq!(db.now(MASTER)?, 2);
        assert_eq!(db.now("child")?, 3);
        assert_eq!(db.get(MASTER, "ks", "a", 2)?, Some(b"x".to_vec()));
        assert_eq!(db.get("child", "ks", "a", 3)?, Some(b"c".to_vec()));
        assert_eq!(db.commit_metadata(MASTER, 1)?, Some(Some(b"first".to_vec())));
        assert_eq!(db.commit_metadata(MASTER, 2)?, Some(None));
        assert_eq!(db.commit_metadata(MASTER, 3)?, None);
        Ok(())
    }

    #[test]
    /// The store directory is exclusively locked.
    fn store_lock_is_exclusive() -> CResult<()> {
        let dir = tempdir::TempDir::new("chronodb")?;
        let db = ChronoDb::open(dir.path(), Config::default())?;
        assert!(ChronoDb::open(dir.path(), Config::default()).is_err());
        drop(db);
        assert!(ChronoDb::open(dir.path(), Config::default()).is_ok());
        Ok(())
    }

    #[test]
    /// Automatic rollover at the configured head capacity, with reads
    /// walking back across the resulting chunks.
    fn capacity_rollover_preserves_reads() -> CResult<()> {
        let config = Config {
            storage_chunk_rollover_rows: Some(2),
            ..Config::default()
        };
        let (_dir, db) = setup_with(config)?;
        for i in 1..=6u8 {
            db.commit(
                MASTER,
                vec![Mutation::put("ks", format!("k{}", i), vec![i])],
                None,
            )?;
        }

        let chunk_count =
            db.chunk_manager().branch(MASTER)?.chunks().chunk_count();
        assert!(chunk_count >= 3, "expected rollovers, found {} chunks", chunk_count);

        // Every snapshot stays readable across the chunk boundaries.
        for i in 1..=6u8 {
            let t = i as Timestamp;
            assert_eq!(db.get(MASTER, "ks", &format!("k{}", i), t)?, Some(vec![i]));
            assert_eq!(db.get(MASTER, "ks", "k1", t)?, Some(vec![1]));
            assert_eq!(db.get(MASTER, "ks", &format!("k{}", i), t - 1)?, None);
        }
        assert_eq!(
            db.history(MASTER, "ks", "k1", 6, SortOrder::Ascending)?
                .collect::<CResult<Vec<_>>>()?,
            vec![1]
        );

        // An explicit rollover seals the head too; an empty head refuses.
        db.rollover(MASTER)?;
        assert!(matches!(db.rollover(MASTER), Err(Error::InvalidArgument(_))));
        assert_eq!(db.get(MASTER, "ks", "k3", 6)?, Some(vec![3]));
        Ok(())
    }

    #[test]
    /// Commit timestamps and metadata windows, in both orders and paged.
    fn commit_metadata_windows() -> CResult<()> {
        let (_dir, db) = setup()?;
        for i in 1..=5u8 {
            db.commit(
                MASTER,
                vec![Mutation::put("ks", "k", vec![i])],
                Some(&[i]),
            )?;
        }

        assert_eq!(
            db.commit_timestamps_between(MASTER, 2, 4, SortOrder::Ascending)?
                .collect::<CResult<Vec<_>>>()?,
            vec![2, 3, 4]
        );
        assert_eq!(
            db.commit_timestamps_between(MASTER, 2, 4, SortOrder::Descending)?
                .collect::<CResult<Vec<_>>>()?,
            vec![4, 3, 2]
        );

        let metadata = db
            .commit_metadata_between(MASTER, 1, 5, SortOrder::Ascending)?
            .collect::<CResult<Vec<_>>>()?;
        assert_eq!(metadata.len(), 5);
        assert_eq!(metadata[0], (1, Some(vec![1u8])));
        assert_eq!(metadata[4], (5, Some(vec![5u8])));

        // Pages of two: [5,4], [3,2], [1].
        let page = db
            .commit_metadata_paged(MASTER, 1, 5, 2, 1, SortOrder::Descending)?
            .collect::<CResult<Vec<_>>>()?;
        assert_eq!(
            page.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec![3, 2]
        );
        let page = db
            .commit_metadata_paged(MASTER, 1, 5, 2, 2, SortOrder::Descending)?
            .collect::<CResult<Vec<_>>>()?;
        assert_eq!(page.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![1]);
        Ok(())
    }

    #[test]
    /// The read cache serves exact hits and is invalidated per touched row
    /// on commit.
    fn read_cache_round_trip() -> CResult<()> {
        let config = Config {
            cache_enabled: Some(true),
            cache_max_size: Some(64),
            cache_assume_immutable: Some(true),
            ..Config::default()
        };
        let (_dir, db) = setup_with(config)?;
        db.commit(MASTER, vec![Mutation::put("ks", "a", b"x".to_vec())], None)?;

        assert_eq!(db.get(MASTER, "ks", "a", 1)?, Some(b"x".to_vec()));
        assert_eq!(db.get(MASTER, "ks", "a", 1)?, Some(b"x".to_vec()));
        let stats = db.status().read_cache.unwrap();
        assert_eq!(stats.hits, 1);

        // A commit touching the row invalidates its cached entries; the
        // stable snapshot is re-read correctly.
        db.commit(MASTER, vec![Mutation::put("ks", "a", b"y".to_vec())], None)?;
        assert_eq!(db.get(MASTER, "ks", "a", 1)?, Some(b"x".to_vec()));
        assert_eq!(db.get(MASTER, "ks", "a", 2)?, Some(b"y".to_vec()));
        Ok(())
    }

    #[test]
    /// Indexed queries: registration on fresh stores is clean, incremental
    /// maintenance on commit, multi-valued extraction, temporal validity.
    fn index_query_lifecycle() -> CResult<()> {
        let (_dir, db) = setup()?;
        db.register_index("tags", ExtractorKind::JsonField { field: "tags".to_string() })?;
        assert!(!db.index_dirty("tags")?);

        db.commit(
            MASTER,
            vec![
                Mutation::put("ks", "post1", br#"{"tags": ["blue", "green"]}"#.to_vec()),
                Mutation::put("ks", "post2", br#"{"tags": "blue"}"#.to_vec()),
            ],
            None,
        )?;
        db.commit(
            MASTER,
            vec![Mutation::put("ks", "post1", br#"{"tags": ["green"]}"#.to_vec())],
            None,
        )?;

        let spec = SearchSpec::new("tags", SearchCondition::Equals("blue".to_string()));
        assert_eq!(db.query(MASTER, "ks", 1, &spec)?, vec!["post1".to_string(), "post2".to_string()]);
        // post1 dropped "blue" at t=2.
        assert_eq!(db.query(MASTER, "ks", 2, &spec)?, vec!["post2".to_string()]);

        // Deletion terminates all documents of the key.
        db.commit(MASTER, vec![Mutation::delete("ks", "post2")], None)?;
        assert_eq!(db.query(MASTER, "ks", 3, &spec)?, Vec::<String>::new());
        assert_eq!(db.query(MASTER, "ks", 1, &spec)?.len(), 2);

        // Registering over existing data starts dirty.
        db.register_index("late", ExtractorKind::Utf8)?;
        assert!(db.index_dirty("late")?);
        let late_spec = SearchSpec::new("late", SearchCondition::Contains("green".to_string()));
        assert!(matches!(db.query(MASTER, "ks", 1, &late_spec), Err(Error::IndexDirty(_))));
        db.rebuild_index("late")?;
        assert_eq!(db.query(MASTER, "ks", 2, &late_spec)?, vec!["post1".to_string()]);
        Ok(())
    }

    #[test]
    /// Index queries across a fork: ancestor documents answer for keys the
    /// child never touched, and child writes shadow them.
    fn index_query_across_fork() -> CResult<()> {
        let (_dir, db) = setup()?;
        db.register_index("name", ExtractorKind::JsonField { field: "name".to_string() })?;
        db.commit(
            MASTER,
            vec![
                Mutation::put("ks", "k1", br#"{"name": "alice"}"#.to_vec()),
                Mutation::put("ks", "k2", br#"{"name": "alice"}"#.to_vec()),
            ],
            None,
        )?;
        db.create_branch("child", MASTER, 1)?;

        // Child re-writes k1 away from alice; k2 still falls through.
        db.commit("child", vec![Mutation::put("ks", "k1", br#"{"name": "anna"}"#.to_vec())], None)?;

        let spec = SearchSpec::new("name", SearchCondition::Equals("alice".to_string()));
        assert_eq!(db.query("child", "ks", 2, &spec)?, vec!["k2".to_string()]);
        assert_eq!(db.query(MASTER, "ks", 1, &spec)?.len(), 2);

        // Below the fork the child sees the origin's full result.
        assert_eq!(db.query("child", "ks", 1, &spec)?.len(), 2);
        Ok(())
    }

    #[test]
    /// A large commit with an injected index writer failure: base data is
    /// durable and visible, the index is dirty until rebuilt, and the
    /// rebuilt index has the exact expected membership.
    fn index_failure_leaves_base_durable() -> CResult<()> {
        let (_dir, db) = setup()?;
        db.register_index("tags", ExtractorKind::JsonField { field: "tags".to_string() })?;

        let mutations: Vec<Mutation> = (0..1000)
            .map(|i| {
                let tags = if i % 2 == 0 { r#"["even", "all"]"# } else { r#"["odd", "all"]"# };
                Mutation::put("ks", format!("k{:04}", i), format!(r#"{{"tags": {}}}"#, tags).into_bytes())
            })
            .collect();

        db.index_backend().fail_next_apply();
        let err = db.commit(MASTER, mutations, None).unwrap_err();
        assert!(matches!(err, Error::IndexWriteFailed(_)));

        // Base data is visible at the new timestamp.
        assert_eq!(db.now(MASTER)?, 1);
        assert_eq!(
            db.get(MASTER, "ks", "k0501", 1)?,
            Some(br#"{"tags": ["odd", "all"]}"#.to_vec())
        );

        // The index refuses queries until rebuilt.
        let spec = SearchSpec::new("tags", SearchCondition::Equals("even".to_string()));
        assert!(matches!(db.query(MASTER, "ks", 1, &spec), Err(Error::IndexDirty(_))));
        assert!(db.index_dirty("tags")?);

        db.rebuild_index("tags")?;
        assert!(!db.index_dirty("tags")?);
        let evens = db.query(MASTER, "ks", 1, &spec)?;
        assert_eq!(evens.len(), 500);
        assert!(evens.contains(&"k0500".to_string()));
        assert!(!evens.contains(&"k0501".to_string()));
        let all = db.query(
            MASTER,
            "ks",
            1,
            &SearchSpec::new("tags", SearchCondition::Equals("all".to_string())),
        )?;
        assert_eq!(all.len(), 1000);

        // Incremental maintenance works again after the rebuild.
        db.commit(MASTER, vec![Mutation::delete("ks", "k0002")], None)?;
        let evens = db.query(MASTER, "ks", 2, &spec)?;
        assert_eq!(evens.len(), 499);
        Ok(())
    }

    #[test]
    /// Query cache: a commit on a child invalidates the child's cached
    /// queries but never the ancestor's.
    fn query_cache_branch_scoping() -> CResult<()> {
        let config = Config {
            query_cache_enabled: Some(true),
            query_cache_max_size: Some(16),
            ..Config::default()
        };
        let (_dir, db) = setup_with(config)?;
        db.register_index("name", ExtractorKind::JsonField { field: "name".to_string() })?;
        db.commit(MASTER, vec![Mutation::put("ks", "k1", br#"{"name": "alice"}"#.to_vec())], None)?;
        db.create_branch("child", MASTER, 1)?;

        let spec = SearchSpec::new("name", SearchCondition::Equals("alice".to_string()));
        db.query(MASTER, "ks", 1, &spec)?;
        db.query("child", "ks", 1, &spec)?;
        let misses_before = db.status().query_cache.unwrap().misses;

        // A child commit drops only the child's entries.
        db.commit("child", vec![Mutation::put("ks", "k2", br#"{"name": "bob"}"#.to_vec())], None)?;
        db.query(MASTER, "ks", 1, &spec)?; // hit
        db.query("child", "ks", 1, &spec)?; // miss, re-filled
        let stats = db.status().query_cache.unwrap();
        assert_eq!(stats.misses, misses_before + 1);
        assert!(stats.hits >= 1);
        Ok(())
    }

    #[test]
    /// modifications_between covers the branch's own rows only, ascending.
    fn modification_feed() -> CResult<()> {
        let (_dir, db) = setup()?;
        db.commit(MASTER, vec![Mutation::put("ks", "a", b"1".to_vec())], None)?;
        db.commit(
            MASTER,
            vec![
                Mutation::put("ks", "b", b"2".to_vec()),
                Mutation::put("other", "c", b"3".to_vec()),
            ],
            None,
        )?;
        db.create_branch("child", MASTER, 2)?;
        db.commit("child", vec![Mutation::put("ks", "d", b"4".to_vec())], None)?;

        let rows = db.modifications_between(MASTER, 0, 10)?.collect::<CResult<Vec<_>>>()?;
        assert_eq!(
            rows,
            vec![
                (1, "ks".to_string(), "a".to_string()),
                (2, "ks".to_string(), "b".to_string()),
                (2, "other".to_string(), "c".to_string()),
            ]
        );
        // The child's feed carries only its own writes.
        let rows = db.modifications_between("child", 0, 10)?.collect::<CResult<Vec<_>>>()?;
        assert_eq!(rows, vec![(3, "ks".to_string(), "d".to_string())]);

        assert_eq!(db.count_modifications_between(MASTER, 2, 2)?, 2);
        Ok(())
    }

    #[test]
    /// Boundary validation at the API surface.
    fn argument_validation() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(matches!(db.get(MASTER, "", "k", 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            db.get(MASTER, "chronodb_commits", "", 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(db.get(MASTER, "ks", "a\0b", 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(db.get("ghost", "ks", "k", 0), Err(Error::BranchUnknown(_))));
        assert!(matches!(
            db.get(MASTER, "ks", "k", TIMESTAMP_MAX + 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            db.create_branch("chronodb_x", MASTER, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            db.modifications_between(MASTER, 5, 2),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }
}
