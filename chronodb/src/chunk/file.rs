use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::{Timestamp, TIMESTAMP_MAX};

/// Sidecar metadata of one chunk: the time interval it covers and its row
/// count. `valid_to == TIMESTAMP_MAX` marks the head chunk; the row count is
/// authoritative for sealed chunks only (the head's grows until seal).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(rename = "validFrom")]
    pub valid_from: Timestamp,
    #[serde(rename = "validTo")]
    pub valid_to: Timestamp,
    #[serde(rename = "rowCount")]
    pub row_count: u64,
}

impl ChunkMeta {
    pub fn is_head(&self) -> bool {
        self.valid_to == TIMESTAMP_MAX
    }
}

/// A handle over one on-disk chunk: a data file holding the rows of a
/// contiguous time interval `[valid_from, valid_to)` on one branch, plus its
/// sidecar metadata record.
///
/// Exactly one chunk per branch is the head (`valid_to = +∞`); all others are
/// sealed and read-only. Sealing is idempotent and happens once, during
/// rollover.
pub struct ChunkFile {
    branch: String,
    seq: u64,
    data_path: PathBuf,
    meta_path: PathBuf,
    meta: RwLock<ChunkMeta>,
}

impl ChunkFile {
    fn paths(dir: &Path, seq: u64) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("chunk_{:04}.data", seq)),
            dir.join(format!("chunk_{:04}.meta", seq)),
        )
    }

    /// Creates a new head chunk starting at `valid_from` and persists its
    /// sidecar.
    pub fn create(dir: &Path, branch: &str, seq: u64, valid_from: Timestamp) -> CResult<Self> {
        std::fs::create_dir_all(dir)?;
        let (data_path, meta_path) = Self::paths(dir, seq);
        let meta = ChunkMeta { valid_from, valid_to: TIMESTAMP_MAX, row_count: 0 };
        write_meta(&meta_path, &meta)?;
        Ok(Self {
            branch: branch.to_string(),
            seq,
            data_path,
            meta_path,
            meta: RwLock::new(meta),
        })
    }

    /// Loads an existing chunk from its sidecar.
    pub fn load(dir: &Path, branch: &str, seq: u64) -> CResult<Self> {
        let (data_path, meta_path) = Self::paths(dir, seq);
        let raw = std::fs::read(&meta_path)?;
        let meta: ChunkMeta = serde_json::from_slice(&raw)?;
        if meta.valid_to <= meta.valid_from {
            return Err(Error::Internal(format!(
                "chunk {} of branch {} has an empty interval [{}, {})",
                seq, branch, meta.valid_from, meta.valid_to
            )));
        }
        Ok(Self {
            branch: branch.to_string(),
            seq,
            data_path,
            meta_path,
            meta: RwLock::new(meta),
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn metadata(&self) -> ChunkMeta {
        *self.meta.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn valid_from(&self) -> Timestamp {
        self.metadata().valid_from
    }

    pub fn valid_to(&self) -> Timestamp {
        self.metadata().valid_to
    }

    pub fn is_head(&self) -> bool {
        self.metadata().is_head()
    }

    /// Whether this chunk's interval contains `t`.
    pub fn covers(&self, t: Timestamp) -> bool {
        let meta = self.metadata();
        meta.valid_from <= t && t < meta.valid_to
    }

    /// Seals the head at `valid_to` (exclusive) with its final row count and
    /// persists the sidecar. Idempotent for the same `valid_to`; sealing a
    /// chunk that was already sealed differently fails with `ChunkSealed`.
    pub fn seal(&self, valid_to: Timestamp, row_count: u64) -> CResult<()> {
        let mut meta = self.meta.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !meta.is_head() {
            if meta.valid_to == valid_to {
                return Ok(());
            }
            return Err(Error::ChunkSealed(format!(
                "chunk {} of branch {} is already sealed at {}",
                self.seq, self.branch, meta.valid_to
            )));
        }
        if valid_to <= meta.valid_from {
            return Err(Error::Internal(format!(
                "seal at {} would empty chunk {} of branch {} starting at {}",
                valid_to, self.seq, self.branch, meta.valid_from
            )));
        }
        let sealed = ChunkMeta { valid_from: meta.valid_from, valid_to, row_count };
        write_meta(&self.meta_path, &sealed)?;
        *meta = sealed;
        Ok(())
    }
}

/// Writes the sidecar through a temporary file so a crash never leaves a
/// half-written metadata record.
fn write_meta(path: &Path, meta: &ChunkMeta) -> CResult<()> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("meta.tmp");
    std::fs::write(&tmp, serde_json::to_vec(meta)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
