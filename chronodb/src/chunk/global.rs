//! The process-wide chunk handle pool and branch directory.
//!
//! Chunk files are the scarce resource: every open chunk holds an OS file
//! handle and an exclusive lock. The pool keeps at most `max_open_files`
//! handles open, evicting the coldest idle handle when the bound is
//! exceeded. A handle with live transactions is never evicted; if every
//! handle is busy the pool simply runs over the bound until a transaction
//! closes. Transactions report their end through the [`TxnCloser`] callback
//! registered at open time.
//!
//! One mutex serializes handle lifecycle (open, close, touch, refcount) and
//! transaction registration; it is held while opening a handle but never
//! across chunk reads. A separate readers/writer lock guards the branch
//! directory; branch creation takes the writer side.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::branch::{validate_branch_name, Branch};
use crate::chunk::file::ChunkFile;
use crate::error::{CResult, Error};
use crate::storage::kv_file::KvFile;
use crate::storage::txn::{Txn, TxnCloser, TxnMode};
use crate::{Timestamp, MASTER};

/// The default bound on concurrently open chunk files.
pub const DEFAULT_MAX_OPEN_FILES: usize = 5;

struct HandleEntry {
    path: PathBuf,
    kv: Arc<Mutex<KvFile>>,
    refs: usize,
}

#[derive(Default)]
struct HandlePool {
    next_id: u64,
    by_path: HashMap<PathBuf, u64>,
    entries: HashMap<u64, HandleEntry>,
    /// Recency order of handle ids, coldest first.
    recency: VecDeque<u64>,
}

impl HandlePool {
    fn touch(&mut self, id: u64) {
        self.recency.retain(|other| *other != id);
        self.recency.push_back(id);
    }

    fn remove_entry(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            self.by_path.remove(&entry.path);
        }
        self.recency.retain(|other| *other != id);
    }

    /// Closes cold idle handles until the pool is within bounds. Busy
    /// handles are skipped; the pool may stay over the bound.
    fn evict_excess(&mut self, max: usize) {
        while self.entries.len() > max {
            let victim = self
                .recency
                .iter()
                .copied()
                .find(|id| self.entries.get(id).map_or(false, |entry| entry.refs == 0));
            match victim {
                Some(id) => self.remove_entry(id),
                None => break,
            }
        }
    }
}

/// The owning registry of branches and pool of open chunk handles for one
/// store instance. There are no process-wide globals; two stores on
/// different directories are fully independent.
pub struct GlobalChunkManager {
    branches_root: PathBuf,
    max_open_files: usize,
    branches: RwLock<HashMap<String, Arc<Branch>>>,
    pool: Mutex<HandlePool>,
}

impl GlobalChunkManager {
    /// Opens the branch directory under `branches_root`, loading every
    /// existing branch and creating `master` on first open.
    pub fn open(branches_root: &Path, max_open_files: usize) -> CResult<Arc<Self>> {
        if max_open_files == 0 {
            return Err(Error::InvalidArgument(
                "branches.maxOpenFiles must be at least 1".to_string(),
            ));
        }
        std::fs::create_dir_all(branches_root)?;

        let mut branches = HashMap::new();
        for entry in std::fs::read_dir(branches_root)? {
            let entry = entry?;
            if !entry.path().join("branch.meta").is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let branch = Branch::load(branches_root, &name)?;
            branches.insert(name, branch);
        }
        if !branches.contains_key(MASTER) {
            let master = Branch::create(branches_root, MASTER, None)?;
            branches.insert(MASTER.to_string(), master);
        }

        let manager = Arc::new(Self {
            branches_root: branches_root.to_path_buf(),
            max_open_files,
            branches: RwLock::new(branches),
            pool: Mutex::new(HandlePool::default()),
        });

        // Recover each branch's last-committed mark from its commit rows.
        let names = manager.branch_names();
        for name in names {
            let branch = manager.branch(&name)?;
            let recovered = manager.recover_last_committed(&branch)?;
            branch.publish(recovered);
        }
        Ok(manager)
    }

    fn pool(&self) -> MutexGuard<'_, HandlePool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn branches_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Branch>>> {
        self.branches.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn branches_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Branch>>> {
        self.branches.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Looks up a branch by name.
    pub fn branch(&self, name: &str) -> CResult<Arc<Branch>> {
        self.branches_read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BranchUnknown(name.to_string()))
    }

    /// All branch names, sorted.
    pub fn branch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.branches_read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Creates a branch. A fork requires an existing origin and a branching
    /// timestamp no later than the origin's newest commit.
    pub fn create_branch(
        &self,
        name: &str,
        origin: Option<(&str, Timestamp)>,
    ) -> CResult<Arc<Branch>> {
        validate_branch_name(name)?;
        let mut branches = self.branches_write();
        if branches.contains_key(name) {
            return Err(Error::InvalidArgument(format!("branch {} already exists", name)));
        }
        if let Some((origin_name, at)) = origin {
            let origin_branch = branches
                .get(origin_name)
                .ok_or_else(|| Error::BranchUnknown(origin_name.to_string()))?;
            if at > origin_branch.now() {
                return Err(Error::InvalidArgument(format!(
                    "cannot branch {} from {} at {}: origin is at {}",
                    name,
                    origin_name,
                    at,
                    origin_branch.now()
                )));
            }
        }
        let branch = Branch::create(&self.branches_root, name, origin)?;
        branches.insert(name.to_string(), branch.clone());
        Ok(branch)
    }

    /// Returns the chain of branches a read at `(branch, t)` must consult:
    /// the branch itself at `t`, then each origin with the read timestamp
    /// capped at the fork point below it. Commits always apply to the first
    /// entry only.
    pub fn resolve_chain(
        &self,
        branch: &str,
        t: Timestamp,
    ) -> CResult<Vec<(Arc<Branch>, Timestamp)>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.branch(branch)?;
        let mut cap = t;
        loop {
            if !visited.insert(current.name().to_string()) {
                return Err(Error::Internal(format!(
                    "branch origin cycle through {}",
                    current.name()
                )));
            }
            chain.push((current.clone(), cap));
            match current.origin() {
                Some((origin, fork)) => {
                    cap = cap.min(*fork);
                    let next = self.branch(origin)?;
                    current = next;
                }
                None => break,
            }
        }
        Ok(chain)
    }

    /// Opens (or reuses) the pooled handle for a chunk file, marking it
    /// most-recently-used and counting a transaction against it.
    fn acquire_handle(&self, path: &Path) -> CResult<(u64, Arc<Mutex<KvFile>>)> {
        let mut pool = self.pool();
        if let Some(id) = pool.by_path.get(path).copied() {
            let entry = pool
                .entries
                .get_mut(&id)
                .ok_or_else(|| Error::Internal("pool index out of sync".to_string()))?;
            entry.refs += 1;
            let kv = entry.kv.clone();
            pool.touch(id);
            return Ok((id, kv));
        }

        // Handle open performs disk I/O under the pool mutex; this is the
        // longest critical section the pool has.
        let kv = Arc::new(Mutex::new(KvFile::open(path.to_path_buf())?));
        let id = pool.next_id;
        pool.next_id += 1;
        pool.by_path.insert(path.to_path_buf(), id);
        pool.entries.insert(id, HandleEntry { path: path.to_path_buf(), kv: kv.clone(), refs: 1 });
        pool.touch(id);
        pool.evict_excess(self.max_open_files);
        Ok((id, kv))
    }

    /// Opens a transaction on the chunk covering `t` on the branch:
    /// read-write on the head, read-only elsewhere (sealed chunks never take
    /// writes).
    pub fn open_transaction(self: &Arc<Self>, branch: &str, t: Timestamp) -> CResult<Txn> {
        let branch = self.branch(branch)?;
        let chunk = branch.chunks().chunk_for_timestamp(t)?;
        let mode = if chunk.is_head() { TxnMode::ReadWrite } else { TxnMode::Bogus };
        let (id, kv) = self.acquire_handle(chunk.data_path())?;
        Ok(Txn::new(kv, mode, Some((self.clone() as Arc<dyn TxnCloser>, id))))
    }

    /// Opens a read-write transaction on the branch's head chunk, returning
    /// the chunk alongside.
    pub fn open_head_transaction(
        self: &Arc<Self>,
        branch: &Branch,
    ) -> CResult<(Arc<ChunkFile>, Txn)> {
        let head = branch.chunks().head();
        if !head.is_head() {
            return Err(Error::ChunkSealed(format!(
                "head chunk {} of branch {} is sealed",
                head.seq(),
                branch.name()
            )));
        }
        let (id, kv) = self.acquire_handle(head.data_path())?;
        let txn = Txn::new(kv, TxnMode::ReadWrite, Some((self.clone() as Arc<dyn TxnCloser>, id)));
        Ok((head, txn))
    }

    /// Opens a read-only, no-durability transaction on a chunk for point
    /// reads that must not produce side effects.
    pub fn open_bogus_transaction(self: &Arc<Self>, chunk: &ChunkFile) -> CResult<Txn> {
        let (id, kv) = self.acquire_handle(chunk.data_path())?;
        Ok(Txn::new(kv, TxnMode::Bogus, Some((self.clone() as Arc<dyn TxnCloser>, id))))
    }

    /// Closes the handle of a chunk, failing with `HandleBusy` if any
    /// transaction is still live on it. No-op for a chunk that is not open.
    pub fn ensure_closed(&self, chunk: &ChunkFile) -> CResult<()> {
        let mut pool = self.pool();
        if let Some(id) = pool.by_path.get(chunk.data_path()).copied() {
            let refs = pool.entries.get(&id).map_or(0, |entry| entry.refs);
            if refs > 0 {
                return Err(Error::HandleBusy(format!(
                    "chunk {} of branch {} has {} live transactions",
                    chunk.seq(),
                    chunk.branch(),
                    refs
                )));
            }
            pool.remove_entry(id);
        }
        Ok(())
    }

    /// Closes every handle unconditionally. Live transactions keep their
    /// shared engine alive until they finish, but the pool forgets them.
    pub fn shutdown(&self) {
        let mut pool = self.pool();
        let ids: Vec<u64> = pool.entries.keys().copied().collect();
        for id in ids {
            pool.remove_entry(id);
        }
    }

    /// The number of currently open chunk handles.
    pub fn open_handle_count(&self) -> usize {
        self.pool().entries.len()
    }

    /// Recovers a branch's newest commit timestamp from the floor of its
    /// commit rows, walking backward across chunks. A branch without its own
    /// commits sits at its branching timestamp (0 for the root).
    fn recover_last_committed(self: &Arc<Self>, branch: &Arc<Branch>) -> CResult<Timestamp> {
        use crate::codec::temporal_key;
        use crate::{COMMIT_KEYSPACE, TIMESTAMP_MAX};

        let floor_key = temporal_key::encode(COMMIT_KEYSPACE, "", TIMESTAMP_MAX)?;
        let mut chunk = Some(branch.chunks().head());
        while let Some(current) = chunk {
            let txn = self.open_bogus_transaction(&current)?;
            if let Some((key, _)) = txn.floor(&floor_key)? {
                let decoded = temporal_key::decode(&key)?;
                if decoded.keyspace == COMMIT_KEYSPACE && decoded.key.is_empty() {
                    return Ok(decoded.t);
                }
            }
            drop(txn);
            chunk = branch.chunks().chunk_before(&current);
        }
        Ok(branch.branching_timestamp().unwrap_or(0))
    }
}

impl TxnCloser for GlobalChunkManager {
    fn on_transaction_closed(&self, handle_id: u64) {
        let mut pool = self.pool();
        if let Some(entry) = pool.entries.get_mut(&handle_id) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        pool.evict_excess(self.max_open_files);
    }
}
