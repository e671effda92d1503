//! Transactions over a pooled chunk file.
//!
//! A transaction buffers its writes in memory and applies them as one fenced
//! batch on commit, so readers never observe a partially applied commit and
//! a crash recovers to a batch boundary. Reads within the transaction see
//! its own staged writes overlaid on the committed file state.
//!
//! The pool that handed out the underlying file handle needs to know when
//! the transaction ends, whichever way it ends. That notification goes
//! through the [`TxnCloser`] callback interface registered at open time; the
//! transaction holds no structural reference back into the pool.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::kv_file::KvFile;

/// Receives the close notification for a transaction's pool handle.
pub trait TxnCloser: Send + Sync {
    /// Called exactly once when a transaction ends, however it ends.
    fn on_transaction_closed(&self, handle_id: u64);
}

/// The transaction flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnMode {
    /// Buffers writes and commits them as one fenced, synced batch.
    ReadWrite,
    /// A read-only, no-durability transaction for point reads that must not
    /// produce side effects.
    Bogus,
}

/// A transaction on one chunk's KV file.
pub struct Txn {
    /// The shared engine of the pooled chunk handle.
    kv: Arc<Mutex<KvFile>>,

    mode: TxnMode,

    /// Staged writes, applied on commit. Never populated in bogus mode.
    writes: BTreeMap<Vec<u8>, Vec<u8>>,

    /// Close callback and the handle id to report, registered by the pool.
    closer: Option<(Arc<dyn TxnCloser>, u64)>,

    /// Set once the transaction has committed or rolled back.
    finished: bool,
}

impl Txn {
    pub(crate) fn new(
        kv: Arc<Mutex<KvFile>>,
        mode: TxnMode,
        closer: Option<(Arc<dyn TxnCloser>, u64)>,
    ) -> Self {
        Self { kv, mode, writes: BTreeMap::new(), closer, finished: false }
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// The number of staged writes.
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    fn kv(&self) -> CResult<MutexGuard<'_, KvFile>> {
        self.kv
            .lock()
            .map_err(|_| Error::Internal("chunk handle mutex poisoned".to_string()))
    }

    /// Stages a write. The value reaches the file only on commit.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> CResult<()> {
        if self.mode == TxnMode::Bogus {
            return Err(Error::Internal(
                "write attempted in a bogus transaction".to_string(),
            ));
        }
        self.writes.insert(key, value);
        Ok(())
    }

    /// Reads a key, seeing this transaction's own staged writes.
    pub fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some(value) = self.writes.get(key) {
            return Ok(Some(value.clone()));
        }
        self.kv()?.get(key)
    }

    /// Ordered-predecessor lookup merging staged writes with the file state.
    pub fn floor(&self, key: &[u8]) -> CResult<Option<(Vec<u8>, Vec<u8>)>> {
        let staged = self
            .writes
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        let committed = self.kv()?.floor(key)?;
        Ok(match (staged, committed) {
            (Some(s), Some(c)) => Some(if s.0 >= c.0 { s } else { c }),
            (Some(s), None) => Some(s),
            (None, c) => c,
        })
    }

    /// Collects the inclusive key range, merging staged writes over the file
    /// state. The result is ordered by key.
    pub fn scan_collect(&self, lo: &[u8], hi: &[u8]) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_collect_bounds((
            Bound::Included(lo.to_vec()),
            Bound::Included(hi.to_vec()),
        ))
    }

    /// Collects an arbitrary key range, merging staged writes over the file
    /// state. The result is ordered by key.
    pub fn scan_collect_bounds(
        &self,
        bounds: (Bound<Vec<u8>>, Bound<Vec<u8>>),
    ) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .kv()?
            .scan(bounds.clone())
            .collect::<CResult<Vec<_>>>()?
            .into_iter()
            .collect();
        for (key, value) in self.writes.range(bounds) {
            merged.insert(key.clone(), value.clone());
        }
        Ok(merged.into_iter().collect())
    }

    /// The number of live keys in the underlying file, ignoring staged
    /// writes. The commit pipeline uses this for the head chunk's capacity
    /// policy.
    pub fn underlying_key_count(&self) -> CResult<u64> {
        Ok(self.kv()?.key_count())
    }

    /// Commits the staged writes as one fenced, synced batch.
    pub fn commit(mut self) -> CResult<()> {
        if self.mode == TxnMode::ReadWrite && !self.writes.is_empty() {
            let batch: Vec<(Vec<u8>, Option<Vec<u8>>)> = std::mem::take(&mut self.writes)
                .into_iter()
                .map(|(key, value)| (key, Some(value)))
                .collect();
            self.kv()?.apply_batch(&batch)?;
        }
        self.close();
        Ok(())
    }

    /// Discards the staged writes. Nothing has touched the file.
    pub fn rollback(mut self) -> CResult<()> {
        self.writes.clear();
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some((closer, handle_id)) = self.closer.take() {
            closer.on_transaction_closed(handle_id);
        }
    }
}

/// An abandoned transaction rolls back: its writes never reached the file,
/// so dropping the buffer is the rollback.
impl Drop for Txn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> CResult<(tempdir::TempDir, Arc<Mutex<KvFile>>)> {
        let dir = tempdir::TempDir::new("chronodb")?;
        let kv = KvFile::open(dir.path().join("chunk"))?;
        Ok((dir, Arc::new(Mutex::new(kv))))
    }

    struct CloseCounter {
        closed: AtomicUsize,
    }

    impl TxnCloser for CloseCounter {
        fn on_transaction_closed(&self, _handle_id: u64) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reads_see_staged_writes() -> CResult<()> {
        let (_dir, kv) = setup()?;
        kv.lock().unwrap().set(b"a", vec![1])?;

        let mut txn = Txn::new(kv.clone(), TxnMode::ReadWrite, None);
        txn.set(b"b".to_vec(), vec![2])?;
        txn.set(b"a".to_vec(), vec![9])?;

        assert_eq!(txn.get(b"a")?, Some(vec![9]));
        assert_eq!(txn.get(b"b")?, Some(vec![2]));
        assert_eq!(txn.floor(b"bz")?, Some((b"b".to_vec(), vec![2])));
        assert_eq!(
            txn.scan_collect(b"a", b"z")?,
            vec![(b"a".to_vec(), vec![9]), (b"b".to_vec(), vec![2])]
        );

        // Not visible outside before commit.
        assert_eq!(kv.lock().unwrap().get(b"b")?, None);
        assert_eq!(kv.lock().unwrap().get(b"a")?, Some(vec![1]));

        txn.commit()?;
        assert_eq!(kv.lock().unwrap().get(b"b")?, Some(vec![2]));
        assert_eq!(kv.lock().unwrap().get(b"a")?, Some(vec![9]));
        Ok(())
    }

    #[test]
    fn rollback_and_drop_leave_no_trace() -> CResult<()> {
        let (_dir, kv) = setup()?;

        let mut txn = Txn::new(kv.clone(), TxnMode::ReadWrite, None);
        txn.set(b"a".to_vec(), vec![1])?;
        txn.rollback()?;
        assert_eq!(kv.lock().unwrap().get(b"a")?, None);

        let mut txn = Txn::new(kv.clone(), TxnMode::ReadWrite, None);
        txn.set(b"a".to_vec(), vec![1])?;
        drop(txn);
        assert_eq!(kv.lock().unwrap().get(b"a")?, None);
        Ok(())
    }

    #[test]
    fn bogus_transactions_refuse_writes() -> CResult<()> {
        let (_dir, kv) = setup()?;
        kv.lock().unwrap().set(b"a", vec![1])?;

        let mut txn = Txn::new(kv.clone(), TxnMode::Bogus, None);
        assert_eq!(txn.get(b"a")?, Some(vec![1]));
        assert!(txn.set(b"b".to_vec(), vec![2]).is_err());
        Ok(())
    }

    #[test]
    fn closer_fires_exactly_once() -> CResult<()> {
        let (_dir, kv) = setup()?;
        let counter = Arc::new(CloseCounter { closed: AtomicUsize::new(0) });

        // Commit path.
        let txn = Txn::new(kv.clone(), TxnMode::ReadWrite, Some((counter.clone(), 7)));
        txn.commit()?;
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);

        // Drop path.
        let txn = Txn::new(kv.clone(), TxnMode::Bogus, Some((counter.clone(), 7)));
        drop(txn);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 2);

        // Rollback path.
        let txn = Txn::new(kv, TxnMode::ReadWrite, Some((counter.clone(), 7)));
        txn.rollback()?;
        assert_eq!(counter.closed.load(Ordering::SeqCst), 3);
        Ok(())
    }
}
