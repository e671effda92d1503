use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::storage::KeyDir;

const FENCE_LEN: i32 = -2;
const TOMBSTONE_LEN: i32 = -1;

/// An append-only log file, containing a sequence of key/value entries
/// grouped into fenced batches:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32: the value size for a put, -1 for a
///   tombstone, or -2 for a commit fence (which carries no key and no value).
/// - Key as raw bytes (max 2 GB).
/// - Value as raw bytes (max 2 GB).
///
/// Entries only take effect once a commit fence follows them: replay stages
/// entries and applies the staged batch when it reaches a fence. A trailing
/// run of entries with no fence -- a transaction that never committed, or a
/// torn write -- is discarded and truncated away on open. This is what makes
/// a batch commit all-or-nothing across a crash.
pub struct Log {
    /// Path to the log file.
    pub(crate) path: PathBuf,
    /// The opened file containing the log.
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out an
    /// exclusive lock on the file until it is closed, or errors if the lock
    /// is already held.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|err| {
                Error::Storage(format!("{}: {:?}", err, dir.to_str()))
            })?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if try_lock {
            file.try_lock_exclusive()?;
        }

        Ok(Self { path, file })
    }

    /// Replays the log and rebuilds the key directory, applying each fenced
    /// batch in order. An unfenced or torn suffix is truncated away.
    pub fn build_keydir(&mut self) -> CResult<KeyDir> {
        let mut len_buf = [0u8; 4];
        let mut keydir = KeyDir::new();
        let mut staged: Vec<(Vec<u8>, Option<(u64, u32)>)> = Vec::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);

        let mut pos = r.seek(SeekFrom::Start(0))?;
        let mut durable_end = pos;

        while pos < file_len {
            // Read the next entry from the file, returning the key, value
            // position, and value length, None for tombstones, or signalling
            // a fence.
            let mut result = || -> Result<Option<(Vec<u8>, u64, Option<u32>)>, std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let key_len = u32::from_be_bytes(len_buf);
                r.read_exact(&mut len_buf)?;
                let value_len_or_marker = i32::from_be_bytes(len_buf);
                if value_len_or_marker == FENCE_LEN {
                    return Ok(None);
                }
                let value_len_or_tombstone = match value_len_or_marker {
                    l if l >= 0 => Some(l as u32),
                    TOMBSTONE_LEN => None,
                    l => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("unknown value length marker {}", l),
                        ))
                    }
                };
                let value_pos = pos + 4 + 4 + key_len as u64;

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                if let Some(value_len) = value_len_or_tombstone {
                    if value_pos + value_len as u64 > file_len {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "value extends beyond end of file",
                        ));
                    }
                    r.seek_relative(value_len as i64)?; // avoids discarding buffer
                }

                Ok(Some((key, value_pos, value_len_or_tombstone)))
            };

            match result() {
                // A fence: the staged batch becomes visible.
                Ok(None) => {
                    pos += 8;
                    for (key, entry) in staged.drain(..) {
                        match entry {
                            Some(value) => {
                                keydir.insert(key, value);
                            }
                            None => {
                                keydir.remove(&key);
                            }
                        }
                    }
                    durable_end = pos;
                }
                // Stage the entry; it is not visible until its fence.
                Ok(Some((key, value_pos, Some(value_len)))) => {
                    staged.push((key, Some((value_pos, value_len))));
                    pos = value_pos + value_len as u64;
                }
                Ok(Some((key, value_pos, None))) => {
                    staged.push((key, None));
                    pos = value_pos;
                }

                // An incomplete entry at the end of the file is an
                // interrupted write; fall through to the truncation below.
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
        }

        if durable_end < file_len {
            log::warn!(
                "Found {} uncommitted bytes at offset {} in {}, truncating",
                file_len - durable_end,
                durable_end,
                self.path.display()
            );
            self.file.set_len(durable_end)?;
        }

        Ok(keydir)
    }

    /// Reads a value from the log file at the given position and length.
    pub fn read_value(&mut self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends a key/value entry to the log file, using a None value for
    /// tombstones. It returns the position and length of the entry. The entry
    /// does not take effect until a fence is written after it.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let value_len_or_tombstone = value.map_or(TOMBSTONE_LEN, |v| v.len() as i32);
        let len = 4 + 4 + key_len + value_len;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(len as usize, &mut self.file);
        w.write_all(&key_len.to_be_bytes())?;
        w.write_all(&value_len_or_tombstone.to_be_bytes())?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;

        Ok((pos, len))
    }

    /// Appends a commit fence, making every entry since the previous fence
    /// effective. Returns the file length after the fence.
    pub fn write_fence(&mut self) -> CResult<u64> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(8, &mut self.file);
        w.write_all(&0u32.to_be_bytes())?;
        w.write_all(&FENCE_LEN.to_be_bytes())?;
        w.flush()?;
        Ok(pos + 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfenced_suffix_is_discarded() -> CResult<()> {
        let path = tempdir::TempDir::new("chronodb")?.path().join("log");

        let mut log = Log::new(path.clone())?;
        log.write_entry(b"a", Some(&[1]))?;
        log.write_fence()?;
        log.write_entry(b"b", Some(&[2]))?;
        // No fence for b.
        drop(log);

        let mut log = Log::new_with_lock(path, false)?;
        let keydir = log.build_keydir()?;
        assert!(keydir.contains_key(&b"a".to_vec()));
        assert!(!keydir.contains_key(&b"b".to_vec()));

        // The truncation removed the unfenced entry from disk too.
        let keydir = log.build_keydir()?;
        assert_eq!(keydir.len(), 1);
        Ok(())
    }

    #[test]
    fn fences_batch_tombstones() -> CResult<()> {
        let path = tempdir::TempDir::new("chronodb")?.path().join("log");
        let mut log = Log::new(path)?;
        log.write_entry(b"a", Some(&[1]))?;
        log.write_entry(b"b", Some(&[2]))?;
        log.write_fence()?;
        log.write_entry(b"a", None)?;
        log.write_fence()?;

        let keydir = log.build_keydir()?;
        assert!(!keydir.contains_key(&b"a".to_vec()));
        assert!(keydir.contains_key(&b"b".to_vec()));
        Ok(())
    }

    #[test]
    fn torn_tail_truncates_to_last_fence() -> CResult<()> {
        let dir = tempdir::TempDir::new("chronodb")?;
        let path = dir.path().join("complete");
        let truncpath = dir.path().join("truncated");

        let mut log = Log::new(path.clone())?;
        log.write_entry(b"a", Some(&[1, 2, 3]))?;
        let fence_end = log.write_fence()?;
        log.write_entry(b"key", Some(&[1, 2, 3, 4, 5]))?;
        log.write_fence()?;
        drop(log);

        // Truncate at every byte position; everything shorter than the
        // second batch's fence must recover exactly the first batch.
        let size = std::fs::metadata(&path)?.len();
        for pos in 0..size {
            std::fs::copy(&path, &truncpath)?;
            let f = std::fs::OpenOptions::new().write(true).open(&truncpath)?;
            f.set_len(pos)?;
            drop(f);

            let mut log = Log::new_with_lock(truncpath.clone(), false)?;
            let keydir = log.build_keydir()?;
            if pos >= fence_end {
                assert_eq!(keydir.len(), 1, "at truncation {}", pos);
                assert!(keydir.contains_key(&b"a".to_vec()));
            } else {
                assert_eq!(keydir.len(), 0, "at truncation {}", pos);
            }
        }
        Ok(())
    }

    #[test]
    fn log_lock_is_exclusive() -> CResult<()> {
        let path = tempdir::TempDir::new("chronodb")?.path().join("log");
        let log = Log::new(path.clone())?;
        assert!(Log::new(path.clone()).is_err());
        drop(log);
        assert!(Log::new(path).is_ok());
        Ok(())
    }
}
