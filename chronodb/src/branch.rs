use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::chunk::branch::BranchChunkManager;
use crate::error::{CResult, Error};
use crate::{Timestamp, RESERVED_PREFIX};

/// The persisted identity of a branch, written once at creation as
/// `branch.meta` in the branch directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct BranchMeta {
    name: String,
    origin: Option<String>,
    #[serde(rename = "branchingTimestamp")]
    branching_timestamp: Option<Timestamp>,
}

/// Public branch information.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchInfo {
    pub name: String,
    pub origin: Option<String>,
    pub branching_timestamp: Option<Timestamp>,
    pub now: Timestamp,
}

/// A named linear history. The root branch has no origin; every other branch
/// forked from `(origin, branching_timestamp)` and commits strictly above
/// that timestamp. Reads at or below it are answered by the origin chain.
pub struct Branch {
    name: String,
    origin: Option<(String, Timestamp)>,

    /// The timestamp of the last published commit, or the branching
    /// timestamp (resp. 0) if the branch has none of its own. Published with
    /// a release store at the end of a commit; readers load with acquire, so
    /// a read issued after a successful commit observes it.
    last_committed: AtomicU64,

    /// Serializes commits and rollovers on this branch.
    commit_lock: Mutex<()>,

    chunks: BranchChunkManager,
}

impl Branch {
    /// Creates a new branch directory: the root branch when `origin` is
    /// None, otherwise a fork. A fork's chunk sequence starts right above the
    /// branching timestamp; the pre-fork range stays with the origin.
    pub fn create(
        branches_root: &Path,
        name: &str,
        origin: Option<(&str, Timestamp)>,
    ) -> CResult<Arc<Self>> {
        validate_branch_name(name)?;
        let dir = branches_root.join(name);
        if dir.exists() {
            return Err(Error::InvalidArgument(format!("branch {} already exists", name)));
        }
        std::fs::create_dir_all(&dir)?;

        let meta = BranchMeta {
            name: name.to_string(),
            origin: origin.map(|(o, _)| o.to_string()),
            branching_timestamp: origin.map(|(_, t)| t),
        };
        std::fs::write(dir.join("branch.meta"), serde_json::to_vec(&meta)?)?;

        let first_valid_from = origin.map(|(_, t)| t + 1).unwrap_or(0);
        let chunks = BranchChunkManager::create(&dir, name, first_valid_from)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            origin: origin.map(|(o, t)| (o.to_string(), t)),
            last_committed: AtomicU64::new(origin.map(|(_, t)| t).unwrap_or(0)),
            commit_lock: Mutex::new(()),
            chunks,
        }))
    }

    /// Loads an existing branch directory. `last_committed` starts at the
    /// branch's floor (its branching timestamp, or 0) until the owner
    /// recovers the real mark from the commit rows.
    pub fn load(branches_root: &Path, name: &str) -> CResult<Arc<Self>> {
        let dir = branches_root.join(name);
        let raw = std::fs::read(dir.join("branch.meta"))?;
        let meta: BranchMeta = serde_json::from_slice(&raw)?;
        if meta.name != name {
            return Err(Error::Internal(format!(
                "branch directory {} holds metadata for branch {}",
                name, meta.name
            )));
        }
        let origin = match (meta.origin, meta.branching_timestamp) {
            (Some(origin), Some(t)) => Some((origin, t)),
            (None, None) => None,
            _ => {
                return Err(Error::Internal(format!(
                    "branch {} has a partial origin record",
                    name
                )))
            }
        };
        let chunks = BranchChunkManager::open(&dir, name)?;
        let floor = origin.as_ref().map(|(_, t)| *t).unwrap_or(0);
        Ok(Arc::new(Self {
            name: name.to_string(),
            origin,
            last_committed: AtomicU64::new(floor),
            commit_lock: Mutex::new(()),
            chunks,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> Option<&(String, Timestamp)> {
        self.origin.as_ref()
    }

    pub fn branching_timestamp(&self) -> Option<Timestamp> {
        self.origin.as_ref().map(|(_, t)| *t)
    }

    pub fn chunks(&self) -> &BranchChunkManager {
        &self.chunks
    }

    /// The timestamp of the newest visible commit on this branch.
    pub fn now(&self) -> Timestamp {
        self.last_committed.load(Ordering::Acquire)
    }

    /// Publishes a commit: the release barrier paired with the acquire load
    /// in now(). All-or-nothing visibility happens here.
    pub(crate) fn publish(&self, t: Timestamp) {
        self.last_committed.store(t, Ordering::Release);
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    pub fn info(&self) -> BranchInfo {
        BranchInfo {
            name: self.name.clone(),
            origin: self.origin.as_ref().map(|(o, _)| o.clone()),
            branching_timestamp: self.branching_timestamp(),
            now: self.now(),
        }
    }
}

/// Validates a caller-supplied branch name: it doubles as a directory name,
/// so path metacharacters are rejected along with the reserved prefix.
pub fn validate_branch_name(name: &str) -> CResult<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("branch name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("branch name {:?} is reserved", name)));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidArgument(format!(
            "branch name {:?} contains path separators or NUL",
            name
        )));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(Error::InvalidArgument(format!(
            "branch name {:?} uses the reserved prefix {:?}",
            name, RESERVED_PREFIX
        )));
    }
    Ok(())
}
