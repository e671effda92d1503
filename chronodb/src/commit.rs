//! The commit pipeline.
//!
//! Commits on a branch are serialized by the branch's commit lock and
//! totally ordered by strictly increasing timestamps. One commit:
//!
//! 1. takes the branch commit lock,
//! 2. allocates `t = last_committed + 1` (rolling the head chunk over first
//!    if it is at capacity),
//! 3. opens a KV transaction on the head chunk through the handle pool,
//! 4. stages every mutation as a temporal row,
//! 5. computes the index modifications by diffing the currently valid
//!    documents against the newly extracted values,
//! 6. stages the commit metadata row in the same transaction,
//! 7. commits the KV transaction, then the index writer,
//! 8. publishes `t`.
//!
//! Visibility is all-or-nothing at step 8. Any failure before step 7 rolls
//! the staged transaction back and publishes nothing. If the index writer
//! fails after the KV commit, the base data is already durable: the affected
//! indices are marked dirty, `t` is published, and the failure is surfaced
//! as `IndexWriteFailed` for the caller to trigger a rebuild.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::branch::Branch;
use crate::chunk::global::GlobalChunkManager;
use crate::codec::{temporal_key, value};
use crate::error::{CResult, Error};
use crate::index::backend::{IndexBackend, IndexModifications, NewDocument};
use crate::matrix::TemporalMatrix;
use crate::{validate_keyspace, Timestamp, COMMIT_KEYSPACE, TIMESTAMP_MAX};

/// One mutation in a commit: a new value for a key, or its deletion.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub keyspace: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl Mutation {
    pub fn put(keyspace: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self { keyspace: keyspace.into(), key: key.into(), value: Some(value) }
    }

    pub fn delete(keyspace: impl Into<String>, key: impl Into<String>) -> Self {
        Self { keyspace: keyspace.into(), key: key.into(), value: None }
    }
}

/// What a commit did: the allocated timestamp, the rows it touched (for
/// cache invalidation), and whether the index writer failed after the base
/// data became durable.
#[derive(Debug)]
pub struct CommitOutcome {
    pub t: Timestamp,
    pub touched: Vec<(String, String)>,
    pub index_failure: Option<String>,
}

/// Serializes commits per branch and coordinates base data, index, and
/// commit metadata.
pub struct CommitPipeline {
    gcm: Arc<GlobalChunkManager>,
    index: Arc<IndexBackend>,
    rollover_rows: Option<u64>,
}

impl CommitPipeline {
    pub fn new(
        gcm: Arc<GlobalChunkManager>,
        index: Arc<IndexBackend>,
        rollover_rows: Option<u64>,
    ) -> Self {
        Self { gcm, index, rollover_rows }
    }

    /// Commits a batch of mutations with optional metadata, returning the
    /// outcome. The caller surfaces `index_failure` as `IndexWriteFailed`
    /// after running its invalidations.
    pub fn commit(
        &self,
        branch: &str,
        mutations: Vec<Mutation>,
        payload: Option<&[u8]>,
    ) -> CResult<CommitOutcome> {
        let branch = self.gcm.branch(branch)?;
        validate_mutations(&mutations)?;

        let _guard = branch
            .commit_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = branch.now();
        let t = now + 1;
        if t > TIMESTAMP_MAX {
            return Err(Error::BranchStalled(format!(
                "branch {} has exhausted its timestamp range",
                branch.name()
            )));
        }
        self.rollover_if_at_capacity(&branch, now)?;

        let (_head, mut txn) = self.gcm.open_head_transaction(&branch)?;
        let matrix = TemporalMatrix::new(self.gcm.clone(), branch.clone());
        for mutation in &mutations {
            matrix.put(&mutation.keyspace, &mutation.key, t, mutation.value.as_deref(), &mut txn)?;
        }

        let (mods, affected_indices) = self.compute_index_modifications(&branch, &mutations, t)?;

        let payload_bytes = value::encode_commit_payload(payload)?;
        txn.set(
            temporal_key::encode(COMMIT_KEYSPACE, "", t)?,
            value::encode_row(Some(&payload_bytes)),
        )?;

        // The durability point for base data and commit metadata. A failure
        // above this line dropped the transaction: nothing is visible.
        txn.commit()?;

        let index_failure = if mods.is_empty() {
            None
        } else {
            match self.index.apply_modifications(&mods) {
                Ok(()) => None,
                Err(err) => {
                    log::error!(
                        "index writer failed after base commit {}@{}: {}; marking {:?} dirty",
                        branch.name(),
                        t,
                        err,
                        affected_indices
                    );
                    if let Err(flag_err) = self.index.set_dirty(&affected_indices, true) {
                        log::error!("failed to persist dirty flags: {}", flag_err);
                    }
                    Some(err.to_string())
                }
            }
        };

        branch.publish(t);
        Ok(CommitOutcome {
            t,
            touched: mutations
                .into_iter()
                .map(|mutation| (mutation.keyspace, mutation.key))
                .collect(),
            index_failure,
        })
    }

    /// Rolls the head chunk over when the configured capacity is reached.
    /// Holding the commit lock, this is serialized with commits.
    fn rollover_if_at_capacity(&self, branch: &Arc<Branch>, now: Timestamp) -> CResult<()> {
        let Some(max_rows) = self.rollover_rows else {
            return Ok(());
        };
        let head = branch.chunks().head();
        if now < head.valid_from() {
            return Ok(()); // freshly rolled over, head is empty
        }
        let txn = self.gcm.open_bogus_transaction(&head)?;
        let rows = txn.underlying_key_count()?;
        drop(txn);
        if rows >= max_rows {
            branch.chunks().perform_rollover(now, rows)?;
        }
        Ok(())
    }

    /// Diffs the currently valid documents of every touched row against the
    /// newly extracted value sets: stale values are terminated at `t`, new
    /// values become documents starting at `t`, unchanged values keep their
    /// documents. Returns the modifications and the affected index names.
    fn compute_index_modifications(
        &self,
        branch: &Branch,
        mutations: &[Mutation],
        t: Timestamp,
    ) -> CResult<(IndexModifications, Vec<String>)> {
        let mut mods = IndexModifications::default();
        let mut affected = BTreeSet::new();
        for index in self.index.index_names() {
            for mutation in mutations {
                let current = self.index.current_documents(
                    branch.name(),
                    &mutation.keyspace,
                    &mutation.key,
                    &index,
                );
                let new_values = match &mutation.value {
                    Some(value) => self.index.extract(&index, value)?,
                    None => BTreeSet::new(),
                };

                for doc in &current {
                    if !new_values.contains(&doc.value) {
                        mods.terminations.push((doc.id, t));
                        affected.insert(index.clone());
                    }
                }
                let existing: BTreeSet<&String> = current.iter().map(|doc| &doc.value).collect();
                for value in &new_values {
                    if !existing.contains(value) {
                        mods.creations.push(NewDocument {
                            branch: branch.name().to_string(),
                            keyspace: mutation.keyspace.clone(),
                            key: mutation.key.clone(),
                            index: index.clone(),
                            value: value.clone(),
                            valid_from: t,
                            valid_to: TIMESTAMP_MAX,
                        });
                        affected.insert(index.clone());
                    }
                }
            }
        }
        Ok((mods, affected.into_iter().collect()))
    }
}

/// Boundary validation of a commit's mutations: well-formed keyspaces and
/// keys, and at most one mutation per row (two rows at one `(keyspace, key,
/// t)` would be undefined downstream).
fn validate_mutations(mutations: &[Mutation]) -> CResult<()> {
    let mut seen = HashSet::new();
    for mutation in mutations {
        validate_keyspace(&mutation.keyspace)?;
        if mutation.key.contains('\0') {
            return Err(Error::InvalidArgument(
                "key must not contain NUL bytes".to_string(),
            ));
        }
        if !seen.insert((mutation.keyspace.as_str(), mutation.key.as_str())) {
            return Err(Error::InvalidArgument(format!(
                "duplicate mutation for ({}, {})",
                mutation.keyspace, mutation.key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_mutations_are_rejected() {
        let mutations = vec![
            Mutation::put("ks", "k", vec![1]),
            Mutation::delete("ks", "k"),
        ];
        assert!(matches!(validate_mutations(&mutations), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn reserved_and_malformed_names_are_rejected() {
        assert!(validate_mutations(&[Mutation::put("", "k", vec![])]).is_err());
        assert!(validate_mutations(&[Mutation::put("chronodb_x", "k", vec![])]).is_err());
        assert!(validate_mutations(&[Mutation::put("ks", "a\0b", vec![])]).is_err());
        assert!(validate_mutations(&[Mutation::put("ks", "k", vec![])]).is_ok());
    }
}
