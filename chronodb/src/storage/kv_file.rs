use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::log::Log;
use crate::storage::{KeyDir, ScanIteratorT, Status};

/// A log-structured ordered key/value engine over a single file. This is the
/// backing store of one chunk: writes append to the log, and an in-memory
/// key directory maps each live key to its value's position. All live keys
/// must fit in memory.
///
/// Every mutation becomes effective only at a commit fence. Direct set() and
/// delete() calls fence themselves; apply_batch() writes many entries under
/// one fence and syncs, which is how a transaction commits atomically.
///
/// Replaced values, tombstones, and intermediate fences accumulate as garbage
/// in the file; compact() rewrites the live entries into a fresh log and
/// swaps it in place.
pub struct KvFile {
    /// The active append-only log file.
    log: Log,

    /// Maps keys to a value position and length in the log file.
    keydir: KeyDir,
}

impl KvFile {
    /// Opens or creates a KvFile at the given path.
    pub fn open(path: PathBuf) -> CResult<Self> {
        Self::open_with_lock(path, true)
    }

    pub fn open_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        let mut log = Log::new_with_lock(path, try_lock)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    /// Opens a KvFile, and automatically compacts it if the amount of
    /// garbage exceeds the given ratio when opened.
    pub fn open_compact(path: PathBuf, garbage_ratio_threshold: f64) -> CResult<Self> {
        let mut s = Self::open(path)?;

        let status = s.status()?;
        let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
        if status.garbage_disk_size > 0 && garbage_ratio >= garbage_ratio_threshold {
            log::info!(
                "Compacting {} to remove {:.3}MB garbage ({:.0}% of {:.3}MB)",
                s.log.path.display(),
                status.garbage_disk_size / 1024 / 1024,
                garbage_ratio * 100.0,
                status.total_disk_size / 1024 / 1024
            );
            s.compact()?;
            log::info!(
                "Compacted {} to size {:.3}MB",
                s.log.path.display(),
                (status.total_disk_size - status.garbage_disk_size) / 1024 / 1024
            );
        }

        Ok(s)
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    /// The number of live keys, without a full status scan.
    pub fn key_count(&self) -> u64 {
        self.keydir.len() as u64
    }

    /// Applies a batch of writes (None = delete) under a single commit fence
    /// and syncs the file. The batch is visible after recovery either in its
    /// entirety or not at all.
    pub fn apply_batch(&mut self, batch: &[(Vec<u8>, Option<Vec<u8>>)]) -> CResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut staged = Vec::with_capacity(batch.len());
        for (key, value) in batch {
            let (pos, len) = self.log.write_entry(key, value.as_deref())?;
            let entry = value.as_ref().map(|value| {
                let value_len = value.len() as u32;
                (pos + len as u64 - value_len as u64, value_len)
            });
            staged.push((key, entry));
        }
        self.log.write_fence()?;
        self.log.file.sync_all()?;
        for (key, entry) in staged {
            match entry {
                Some(entry) => {
                    self.keydir.insert(key.clone(), entry);
                }
                None => {
                    self.keydir.remove(key);
                }
            }
        }
        Ok(())
    }

    /// Compacts the current log file by writing out a new log file containing
    /// only live keys and replacing the current file with it.
    pub fn compact(&mut self) -> CResult<()> {
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");

        let (mut new_log, new_keydir) = self.write_log(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path).map_err(|err| {
            Error::Storage(format!(
                "compaction rename from {:?} to {:?} failed: {}",
                new_log.path.to_str(),
                self.log.path.to_str(),
                err
            ))
        })?;
        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes out a new log file with the live entries of the current log
    /// file and returns it along with its keydir. Entries are written in key
    /// order, closed by a single fence.
    fn write_log(&mut self, path: PathBuf) -> CResult<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // truncate file if it exists
        for (key, (value_pos, value_len)) in self.keydir.iter() {
            let value = self.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(key, Some(&value))?;
            new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
        }
        if !new_keydir.is_empty() {
            new_log.write_fence()?;
        }
        new_log.file.sync_all()?;
        Ok((new_log, new_keydir))
    }
}

impl std::fmt::Display for KvFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kv file")
    }
}

impl Engine for KvFile {
    type ScanIterator<'a> = KvFileScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.log.write_entry(key, None)?;
        self.log.write_fence()?;
        self.keydir.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.log.file.sync_all()?)
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some((value_pos, value_len)) = self.keydir.get(key) {
            Ok(Some(self.log.read_value(*value_pos, *value_len)?))
        } else {
            Ok(None)
        }
    }

    fn floor(&mut self, key: &[u8]) -> CResult<Option<(Vec<u8>, Vec<u8>)>> {
        let entry = self
            .keydir
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(key, (value_pos, value_len))| (key.clone(), *value_pos, *value_len));
        match entry {
            Some((key, value_pos, value_len)) => {
                Ok(Some((key, self.log.read_value(value_pos, value_len)?)))
            }
            None => Ok(None),
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        KvFileScanIterator { inner: self.keydir.range(range), log: &mut self.log }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some(&value))?;
        self.log.write_fence()?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0, |size, (key, (_, value_len))| size + key.len() as u64 + *value_len as u64);
        let total_disk_size = self.log.file.metadata()?.len();
        // Length prefixes per entry, plus the single closing fence a
        // compacted log carries.
        let live_disk_size = if keys > 0 { size + 8 * keys + 8 } else { 0 };
        let garbage_disk_size = total_disk_size.saturating_sub(live_disk_size);
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }
}

/// Attempt to flush the file when the KvFile is closed.
impl Drop for KvFile {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush file: {}", error)
        }
    }
}

pub struct KvFileScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, (u64, u32)>,
    log: &'a mut Log,
}

impl<'a> KvFileScanIterator<'a> {
    fn map(&mut self, item: (&Vec<u8>, &(u64, u32))) -> <Self as Iterator>::Item {
        let (key, (value_pos, value_len)) = item;
        Ok((key.clone(), self.log.read_value(*value_pos, *value_len)?))
    }
}

impl<'a> Iterator for KvFileScanIterator<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl<'a> DoubleEndedIterator for KvFileScanIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}
