//! ChronoDB is a temporal key-value store: every write is timestamped, every
//! read selects a snapshot at a chosen timestamp, and the entire history of a
//! key is retained and queryable.
//!
//! A branch's history is partitioned into on-disk chunks, each covering a
//! contiguous time interval, with a bounded pool of open chunk files. Writes
//! go through a per-branch commit pipeline that makes base data, secondary
//! index updates, and commit metadata visible atomically. Branches fork from
//! an origin at a timestamp; reads before the fork point fall through to the
//! origin transparently.
//!
//! ## Getting started
//!
//! ```rust
//! use chronodb::config::Config;
//! use chronodb::db::{ChronoDb, Mutation};
//! use chronodb::error::CResult;
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> CResult<()> {
//!     let dir = tempdir::TempDir::new("chronodb")?;
//!     let db = ChronoDb::open(dir.path(), Config::default())?;
//!
//!     let t1 = db.commit(
//!         "master",
//!         vec![Mutation::put("people", "alice", b"engineer".to_vec())],
//!         None,
//!     )?;
//!     let t2 = db.commit(
//!         "master",
//!         vec![Mutation::put("people", "alice", b"manager".to_vec())],
//!         None,
//!     )?;
//!
//!     // Reads are point-in-time: each timestamp sees its own snapshot.
//!     assert_eq!(db.get("master", "people", "alice", t1)?, Some(b"engineer".to_vec()));
//!     assert_eq!(db.get("master", "people", "alice", t2)?, Some(b"manager".to_vec()));
//!     assert_eq!(db.get("master", "people", "alice", 0)?, None);
//!
//!     // The full history of the key is retained.
//!     let history = db
//!         .history("master", "people", "alice", t2, chronodb::SortOrder::Descending)?
//!         .collect::<CResult<Vec<_>>>()?;
//!     assert_eq!(history, vec![t2, t1]);
//!
//!     Ok(())
//! }
//! ```

pub mod branch;
pub mod cache;
pub mod chunk;
pub mod codec;
pub mod commit;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod matrix;
pub mod storage;

/// A logical commit timestamp on a branch. Timestamps are unsigned, 63-bit,
/// and strictly increasing per branch; `0` denotes "no commit yet".
pub type Timestamp = u64;

/// The largest valid timestamp. Also the in-memory and on-disk encoding of an
/// open interval end (`validTo = +∞`).
pub const TIMESTAMP_MAX: Timestamp = (1 << 63) - 1;

/// The name of the root branch, which always exists.
pub const MASTER: &str = "master";

/// The reserved name prefix for management keyspaces and keys. User-supplied
/// branch names and keyspaces must not start with it.
pub const RESERVED_PREFIX: &str = "chronodb_";

/// The reserved keyspace holding one row per commit, keyed by the commit
/// timestamp and carrying the commit's metadata payload.
pub(crate) const COMMIT_KEYSPACE: &str = "chronodb_commits";

/// Iteration order for history and metadata sequences.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Validates a caller-supplied keyspace at the API boundary: non-empty, no
/// NUL bytes, and outside the reserved namespace.
pub(crate) fn validate_keyspace(keyspace: &str) -> error::CResult<()> {
    if keyspace.is_empty() {
        return Err(error::Error::InvalidArgument(
            "keyspace must not be empty".to_string(),
        ));
    }
    if keyspace.contains('\0') {
        return Err(error::Error::InvalidArgument(
            "keyspace must not contain NUL bytes".to_string(),
        ));
    }
    if keyspace.starts_with(RESERVED_PREFIX) {
        return Err(error::Error::InvalidArgument(format!(
            "keyspace {:?} uses the reserved prefix {:?}",
            keyspace, RESERVED_PREFIX
        )));
    }
    Ok(())
}
