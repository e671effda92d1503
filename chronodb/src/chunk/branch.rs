use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::chunk::file::ChunkFile;
use crate::error::{CResult, Error};
use crate::Timestamp;

/// Manages the ordered chunk sequence of one branch: locating the chunk that
/// covers a timestamp, listing chunks for a range scan, and rolling the head
/// over.
///
/// The chunks of a branch partition its live time range `[first_valid_from,
/// +∞)` without gap or overlap; the last chunk is always the head. The list
/// only ever grows, and only at the tail.
pub struct BranchChunkManager {
    branch: String,
    dir: PathBuf,
    chunks: RwLock<Vec<Arc<ChunkFile>>>,
}

impl BranchChunkManager {
    /// Creates the chunk sequence of a new branch, with an initial head
    /// starting at `valid_from`.
    pub fn create(dir: &Path, branch: &str, valid_from: Timestamp) -> CResult<Self> {
        let head = Arc::new(ChunkFile::create(dir, branch, 0, valid_from)?);
        Ok(Self {
            branch: branch.to_string(),
            dir: dir.to_path_buf(),
            chunks: RwLock::new(vec![head]),
        })
    }

    /// Opens an existing branch directory, reloading its chunk sequence and
    /// validating the partition invariant.
    pub fn open(dir: &Path, branch: &str) -> CResult<Self> {
        let mut seqs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(seq) = name.strip_prefix("chunk_").and_then(|n| n.strip_suffix(".meta")) {
                let seq: u64 = seq.parse().map_err(|_| {
                    Error::Storage(format!("unparseable chunk file name {:?}", name))
                })?;
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();

        let mut chunks = Vec::with_capacity(seqs.len());
        for (i, seq) in seqs.iter().enumerate() {
            if *seq != i as u64 {
                return Err(Error::Internal(format!(
                    "branch {} chunk sequence has a hole: expected {}, found {}",
                    branch, i, seq
                )));
            }
            chunks.push(Arc::new(ChunkFile::load(dir, branch, *seq)?));
        }
        if chunks.is_empty() {
            return Err(Error::Internal(format!("branch {} has no chunks", branch)));
        }
        for pair in chunks.windows(2) {
            if pair[0].valid_to() != pair[1].valid_from() {
                return Err(Error::Internal(format!(
                    "branch {} chunks {} and {} do not partition time: [{}, {}) then [{}, {})",
                    branch,
                    pair[0].seq(),
                    pair[1].seq(),
                    pair[0].valid_from(),
                    pair[0].valid_to(),
                    pair[1].valid_from(),
                    pair[1].valid_to(),
                )));
            }
        }
        let head = chunks.last().cloned();
        if let Some(head) = head {
            if !head.is_head() {
                return Err(Error::Internal(format!(
                    "branch {} last chunk {} is sealed; no head",
                    branch,
                    head.seq()
                )));
            }
        }

        Ok(Self {
            branch: branch.to_string(),
            dir: dir.to_path_buf(),
            chunks: RwLock::new(chunks),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<ChunkFile>>> {
        self.chunks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<ChunkFile>>> {
        self.chunks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn chunk_count(&self) -> usize {
        self.read().len()
    }

    /// The start of the branch's live time range.
    pub fn first_valid_from(&self) -> Timestamp {
        self.read()[0].valid_from()
    }

    /// The head chunk, the only writable one.
    pub fn head(&self) -> Arc<ChunkFile> {
        self.read().last().cloned().expect("a branch always has a head chunk")
    }

    /// Returns the chunk whose interval contains `t`. Fails with
    /// `ChunkMissing` only if `t` precedes the first chunk.
    pub fn chunk_for_timestamp(&self, t: Timestamp) -> CResult<Arc<ChunkFile>> {
        let chunks = self.read();
        let idx = chunks.partition_point(|chunk| chunk.valid_from() <= t);
        if idx == 0 {
            return Err(Error::ChunkMissing(format!(
                "timestamp {} precedes branch {} which starts at {}",
                t,
                self.branch,
                chunks[0].valid_from()
            )));
        }
        Ok(chunks[idx - 1].clone())
    }

    /// All chunks whose intervals intersect `[lo, hi]`, ascending.
    pub fn chunks_in_range(&self, lo: Timestamp, hi: Timestamp) -> Vec<Arc<ChunkFile>> {
        self.read()
            .iter()
            .filter(|chunk| {
                let meta = chunk.metadata();
                meta.valid_from <= hi && lo < meta.valid_to
            })
            .cloned()
            .collect()
    }

    /// The chunk preceding the given one in the sequence, for the backward
    /// time-walk of point-in-time reads.
    pub fn chunk_before(&self, chunk: &ChunkFile) -> Option<Arc<ChunkFile>> {
        let seq = chunk.seq();
        if seq == 0 {
            return None;
        }
        self.read().get(seq as usize - 1).cloned()
    }

    /// Seals the head at `t_now + 1` and opens a new head beginning at
    /// `t_now + 1`, returning `(old_head, new_head)`. Serialized per branch
    /// by the chunk-list lock; callers additionally hold the branch commit
    /// lock so a rollover never races a commit.
    pub fn perform_rollover(
        &self,
        t_now: Timestamp,
        row_count: u64,
    ) -> CResult<(Arc<ChunkFile>, Arc<ChunkFile>)> {
        let mut chunks = self.write();
        let old_head = chunks
            .last()
            .cloned()
            .ok_or_else(|| Error::Internal(format!("branch {} has no chunks", self.branch)))?;
        if t_now + 1 <= old_head.valid_from() {
            return Err(Error::Internal(format!(
                "rollover at {} would empty head chunk {} of branch {}",
                t_now,
                old_head.seq(),
                self.branch
            )));
        }
        old_head.seal(t_now + 1, row_count)?;
        let new_head = Arc::new(ChunkFile::create(
            &self.dir,
            &self.branch,
            old_head.seq() + 1,
            t_now + 1,
        )?);
        chunks.push(new_head.clone());
        log::info!(
            "Rolled over branch {}: chunk {} sealed at {}, chunk {} opened",
            self.branch,
            old_head.seq(),
            t_now + 1,
            new_head.seq()
        );
        Ok((old_head, new_head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> CResult<(tempdir::TempDir, BranchChunkManager)> {
        let dir = tempdir::TempDir::new("chronodb")?;
        let mgr = BranchChunkManager::create(dir.path(), "master", 0)?;
        Ok((dir, mgr))
    }

    #[test]
    fn lookup_on_single_head() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        assert_eq!(mgr.chunk_count(), 1);
        assert_eq!(mgr.chunk_for_timestamp(0)?.seq(), 0);
        assert_eq!(mgr.chunk_for_timestamp(1_000_000)?.seq(), 0);
        Ok(())
    }

    #[test]
    fn rollover_partitions_time() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let (old_head, new_head) = mgr.perform_rollover(10, 10)?;
        assert_eq!(old_head.valid_to(), 11);
        assert_eq!(new_head.valid_from(), 11);
        assert!(new_head.is_head());

        let (_, newer) = mgr.perform_rollover(20, 9)?;
        assert_eq!(newer.valid_from(), 21);

        // Timestamp routing across the three chunks.
        assert_eq!(mgr.chunk_for_timestamp(0)?.seq(), 0);
        assert_eq!(mgr.chunk_for_timestamp(10)?.seq(), 0);
        assert_eq!(mgr.chunk_for_timestamp(11)?.seq(), 1);
        assert_eq!(mgr.chunk_for_timestamp(20)?.seq(), 1);
        assert_eq!(mgr.chunk_for_timestamp(21)?.seq(), 2);
        assert_eq!(mgr.chunk_for_timestamp(1 << 40)?.seq(), 2);

        // Range listing.
        let seqs: Vec<u64> =
            mgr.chunks_in_range(5, 15).iter().map(|chunk| chunk.seq()).collect();
        assert_eq!(seqs, vec![0, 1]);
        let seqs: Vec<u64> =
            mgr.chunks_in_range(0, 1 << 40).iter().map(|chunk| chunk.seq()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let seqs: Vec<u64> =
            mgr.chunks_in_range(21, 22).iter().map(|chunk| chunk.seq()).collect();
        assert_eq!(seqs, vec![2]);
        Ok(())
    }

    #[test]
    fn missing_chunk_below_fork_start() -> CResult<()> {
        let dir = tempdir::TempDir::new("chronodb")?;
        let mgr = BranchChunkManager::create(dir.path(), "child", 6)?;
        assert!(matches!(mgr.chunk_for_timestamp(5), Err(Error::ChunkMissing(_))));
        assert_eq!(mgr.chunk_for_timestamp(6)?.seq(), 0);
        Ok(())
    }

    #[test]
    fn reopen_validates_partition() -> CResult<()> {
        let dir = tempdir::TempDir::new("chronodb")?;
        {
            let mgr = BranchChunkManager::create(dir.path(), "master", 0)?;
            mgr.perform_rollover(10, 3)?;
            mgr.perform_rollover(25, 2)?;
        }
        let mgr = BranchChunkManager::open(dir.path(), "master")?;
        assert_eq!(mgr.chunk_count(), 3);
        assert_eq!(mgr.chunk_for_timestamp(11)?.seq(), 1);
        assert!(mgr.head().is_head());
        assert_eq!(mgr.head().valid_from(), 26);
        Ok(())
    }
}
