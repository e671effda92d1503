//! The temporal matrix: point-in-time reads and history scans over one
//! branch's chunk sequence.
//!
//! Every row of a branch lives at a temporal key `(keyspace, key, t)`. For
//! example, the keys a,b,c,d may have the following rows at various logical
//! timestamps (x is a tombstone):
//!
//! ```text
//! Time
//! 5
//! 4  a4
//! 3      b3      x
//! 2
//! 1  a1      c1  d1
//!    a   b   c   d   Keys
//! ```
//!
//! * A read at T=2 sees a=a1, c=c1, d=d1.
//! * A read at T=5 sees a=a4, b=b3, c=c1; d was deleted at t=3.
//!
//! Because temporal keys order by `(keyspace, key, t)`, the live row at `T`
//! is the ordered predecessor of `(keyspace, key, T)` -- a single floor
//! lookup, no deserialization. The branch's history is partitioned across
//! chunks, so a key whose latest write predates the chunk covering `T` is
//! found by walking backward chunk by chunk.
//!
//! Writes always target the head chunk, through the commit pipeline, which
//! allocates a timestamp strictly above everything already committed.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use crate::branch::Branch;
use crate::chunk::file::ChunkFile;
use crate::chunk::global::GlobalChunkManager;
use crate::codec::{temporal_key, value};
use crate::error::{CResult, Error};
use crate::storage::txn::Txn;
use crate::{SortOrder, Timestamp, RESERVED_PREFIX};

/// The outcome of a point-in-time read on one branch: a live value, a
/// tombstone (the key was deleted at or before the read time), or no row at
/// all on this branch -- in which case an origin branch may still answer.
#[derive(Clone, Debug, PartialEq)]
pub enum RowState {
    Value(Vec<u8>),
    Tombstone,
    Absent,
}

/// Read and write operations over one branch's chunks.
pub struct TemporalMatrix {
    gcm: Arc<GlobalChunkManager>,
    branch: Arc<Branch>,
}

impl TemporalMatrix {
    pub fn new(gcm: Arc<GlobalChunkManager>, branch: Arc<Branch>) -> Self {
        Self { gcm, branch }
    }

    /// The live row of `(keyspace, key)` at `T` on this branch: an ordered
    /// predecessor lookup in the chunk covering `T`, walking backward across
    /// chunks while the key contributes no row.
    pub fn get(&self, keyspace: &str, key: &str, t: Timestamp) -> CResult<RowState> {
        let search = temporal_key::encode(keyspace, key, t)?;
        let mut chunk = self.branch.chunks().chunk_for_timestamp(t)?;
        loop {
            let txn = self.gcm.open_bogus_transaction(&chunk)?;
            let found = txn.floor(&search)?;
            drop(txn);

            if let Some((found_key, row)) = found {
                let decoded = temporal_key::decode(&found_key)?;
                if decoded.keyspace == keyspace && decoded.key == key {
                    return Ok(match value::row_payload(&row)? {
                        Some(payload) => RowState::Value(payload.to_vec()),
                        None => RowState::Tombstone,
                    });
                }
            }
            match self.branch.chunks().chunk_before(&chunk) {
                Some(previous) => chunk = previous,
                None => return Ok(RowState::Absent),
            }
        }
    }

    /// The commit timestamps of `(keyspace, key)` up to and including `T`,
    /// as a lazy single-pass sequence in the requested order. One chunk is
    /// buffered at a time.
    pub fn history(
        &self,
        keyspace: &str,
        key: &str,
        t: Timestamp,
        order: SortOrder,
    ) -> CResult<HistoryIter> {
        let lo = temporal_key::encode(keyspace, key, 0)?;
        let hi = temporal_key::encode(keyspace, key, t)?;
        let mut chunks = self.branch.chunks().chunks_in_range(0, t);
        if order == SortOrder::Descending {
            chunks.reverse();
        }
        Ok(HistoryIter {
            gcm: self.gcm.clone(),
            chunks,
            next_chunk: 0,
            buffer: VecDeque::new(),
            lo,
            hi,
            order,
        })
    }

    /// Every base-data row in the time window `[lo, hi]`, as a lazy sequence
    /// of `(t, keyspace, key)` ascending by timestamp. Management rows are
    /// not included.
    pub fn modifications_between(
        &self,
        lo: Timestamp,
        hi: Timestamp,
    ) -> CResult<ModificationsIter> {
        Ok(ModificationsIter {
            gcm: self.gcm.clone(),
            chunks: self.branch.chunks().chunks_in_range(lo, hi),
            next_chunk: 0,
            buffer: VecDeque::new(),
            lo,
            hi,
        })
    }

    /// Counts the base-data rows in the time window `[lo, hi]`.
    pub fn count_between(&self, lo: Timestamp, hi: Timestamp) -> CResult<u64> {
        let mut count = 0;
        for row in self.modifications_between(lo, hi)? {
            row?;
            count += 1;
        }
        Ok(count)
    }

    /// Every row in `[lo, hi]` with its payload, ascending by timestamp.
    /// Collected eagerly; this backs index rebuilds.
    pub(crate) fn rows_between(
        &self,
        lo: Timestamp,
        hi: Timestamp,
    ) -> CResult<Vec<(Timestamp, String, String, Option<Vec<u8>>)>> {
        let mut rows = Vec::new();
        for chunk in self.branch.chunks().chunks_in_range(lo, hi) {
            let txn = self.gcm.open_bogus_transaction(&chunk)?;
            for (key, row) in txn.scan_collect_bounds((Bound::Unbounded, Bound::Unbounded))? {
                let decoded = temporal_key::decode(&key)?;
                if decoded.keyspace.starts_with(RESERVED_PREFIX) {
                    continue;
                }
                if decoded.t < lo || decoded.t > hi {
                    continue;
                }
                let payload = value::decode_row(&row)?;
                rows.push((decoded.t, decoded.keyspace, decoded.key, payload));
            }
        }
        rows.sort_by(|a, b| (a.0, &a.1, &a.2).cmp(&(b.0, &b.1, &b.2)));
        Ok(rows)
    }

    /// Stages a row write into the head chunk's open transaction. Only the
    /// head takes writes, at timestamps strictly above everything already
    /// committed on the branch.
    pub fn put(
        &self,
        keyspace: &str,
        key: &str,
        t: Timestamp,
        row: Option<&[u8]>,
        txn: &mut Txn,
    ) -> CResult<()> {
        let head = self.branch.chunks().head();
        if !head.is_head() {
            return Err(Error::ChunkSealed(format!(
                "chunk {} of branch {} no longer takes writes",
                head.seq(),
                self.branch.name()
            )));
        }
        if t < head.valid_from() || t <= self.branch.now() {
            return Err(Error::TimestampPrecedesHead(format!(
                "write at {} on branch {}: head starts at {}, last commit is {}",
                t,
                self.branch.name(),
                head.valid_from(),
                self.branch.now()
            )));
        }
        txn.set(temporal_key::encode(keyspace, key, t)?, value::encode_row(row))
    }
}

/// Lazy single-pass sequence of a key's commit timestamps. Buffers one chunk
/// at a time through short-lived read transactions.
pub struct HistoryIter {
    gcm: Arc<GlobalChunkManager>,
    chunks: Vec<Arc<ChunkFile>>,
    next_chunk: usize,
    buffer: VecDeque<Timestamp>,
    lo: Vec<u8>,
    hi: Vec<u8>,
    order: SortOrder,
}

impl HistoryIter {
    /// Fills the buffer from the next chunk. Returns false once exhausted.
    fn try_fill(&mut self) -> CResult<bool> {
        while self.buffer.is_empty() {
            let Some(chunk) = self.chunks.get(self.next_chunk) else {
                return Ok(false);
            };
            self.next_chunk += 1;

            let txn = self.gcm.open_bogus_transaction(chunk)?;
            let rows = txn.scan_collect(&self.lo, &self.hi)?;
            drop(txn);

            // The scan range frames exactly the versions of the one key, in
            // ascending timestamp order.
            let mut timestamps = Vec::with_capacity(rows.len());
            for (key, _) in rows {
                timestamps.push(temporal_key::decode(&key)?.t);
            }
            if self.order == SortOrder::Descending {
                timestamps.reverse();
            }
            self.buffer.extend(timestamps);
        }
        Ok(true)
    }
}

impl Iterator for HistoryIter {
    type Item = CResult<Timestamp>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_fill() {
            Ok(true) => self.buffer.pop_front().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.next_chunk = self.chunks.len();
                Some(Err(err))
            }
        }
    }
}

/// Lazy single-pass sequence of `(t, keyspace, key)` modifications in a time
/// window, ascending by timestamp. Buffers one chunk at a time.
pub struct ModificationsIter {
    gcm: Arc<GlobalChunkManager>,
    chunks: Vec<Arc<ChunkFile>>,
    next_chunk: usize,
    buffer: VecDeque<(Timestamp, String, String)>,
    lo: Timestamp,
    hi: Timestamp,
}

impl ModificationsIter {
    fn try_fill(&mut self) -> CResult<bool> {
        while self.buffer.is_empty() {
            let Some(chunk) = self.chunks.get(self.next_chunk) else {
                return Ok(false);
            };
            self.next_chunk += 1;

            let txn = self.gcm.open_bogus_transaction(chunk)?;
            let rows = txn.scan_collect_bounds((Bound::Unbounded, Bound::Unbounded))?;
            drop(txn);

            let mut entries = Vec::new();
            for (key, _) in rows {
                let decoded = temporal_key::decode(&key)?;
                if decoded.keyspace.starts_with(RESERVED_PREFIX) {
                    continue;
                }
                if decoded.t < self.lo || decoded.t > self.hi {
                    continue;
                }
                entries.push((decoded.t, decoded.keyspace, decoded.key));
            }
            entries.sort();
            self.buffer.extend(entries);
        }
        Ok(true)
    }
}

impl Iterator for ModificationsIter {
    type Item = CResult<(Timestamp, String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_fill() {
            Ok(true) => self.buffer.pop_front().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.next_chunk = self.chunks.len();
                Some(Err(err))
            }
        }
    }
}
