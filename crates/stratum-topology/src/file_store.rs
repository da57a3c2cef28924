//! Durable KV store: an append-only record log replayed into a BTreeMap.
//!
//! Each record is a little-endian `u32` length followed by a bincode-encoded
//! [`LogRecord`]. Every append is fsynced before the call returns. A torn
//! record at the tail (crash mid-append) is cut off on open; a record that
//! decodes badly anywhere else is reported as corruption.
//!
//! An append that fails is cut back off the log before the error is
//! returned. If that cut fails too, the store refuses all further writes.
//!
//! [`FileKvStore::compact`] rewrites the log as one `Put` per live key.
//!
//! The directory is owned exclusively through an advisory lock on `LOCK`,
//! held for the lifetime of the store.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::kvstore::{scan_map_prefix, Key, KvPair, KvStore, Value};

const LOG_FILENAME: &str = "topology.log";
const COMPACT_FILENAME: &str = "topology.log.compact";
const LOCK_FILENAME: &str = "LOCK";

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

fn encode_record(record: &LogRecord, out: &mut Vec<u8>) -> Result<(), StoreError> {
    let body = bincode::serialize(record)?;
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// File-backed KV store.
pub struct FileKvStore {
    dir: PathBuf,
    data: RwLock<BTreeMap<Key, Value>>,
    // Serializes appends; held across the map update so the map never runs
    // ahead of the log.
    log: Mutex<File>,
    // Set when a failed append could not be cut back off the log.
    failed: AtomicBool,
    // Holds the exclusive lock; released on drop.
    _lock: File,
    #[cfg(test)]
    fault: Mutex<Option<tests::Fault>>,
}

impl FileKvStore {
    /// Opens or creates the store in `dir`, replaying the existing log.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILENAME))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(dir.display().to_string()))?;

        let path = dir.join(LOG_FILENAME);

        let mut data = BTreeMap::new();
        let valid_len = replay(&path, &mut data)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating torn record at end of topology log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(&path)?;

        tracing::debug!(path = %path.display(), keys = data.len(), "opened topology log");

        Ok(Self {
            dir: dir.to_path_buf(),
            data: RwLock::new(data),
            log: Mutex::new(file),
            failed: AtomicBool::new(false),
            _lock: lock,
            #[cfg(test)]
            fault: Mutex::new(None),
        })
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrites the log so it holds exactly one record per live key.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut log = self.log.lock().map_err(poisoned)?;
        let data = self.data.read().map_err(poisoned)?;

        let mut buf = Vec::new();
        for (key, value) in data.iter() {
            encode_record(
                &LogRecord::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
                &mut buf,
            )?;
        }

        let tmp_path = self.dir.join(COMPACT_FILENAME);
        let log_path = self.dir.join(LOG_FILENAME);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &log_path)?;
        *log = OpenOptions::new().append(true).open(&log_path)?;
        // The rewritten log no longer carries any partial append.
        self.failed.store(false, Ordering::Release);

        tracing::info!(keys = data.len(), bytes = buf.len(), "compacted topology log");
        Ok(())
    }

    fn append(&self, record: LogRecord) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        encode_record(&record, &mut buf)?;

        let mut log = self.log.lock().map_err(poisoned)?;
        if self.failed.load(Ordering::Acquire) {
            return Err(StoreError::Corrupt(
                "topology log has an unrecoverable partial append".to_string(),
            ));
        }

        let prev_len = log.metadata()?.len();
        if let Err(e) = self.write_frame(&mut log, &buf) {
            match log.set_len(prev_len).and_then(|()| log.sync_data()) {
                Ok(()) => {
                    tracing::warn!(error = %e, "topology log append failed; record discarded");
                }
                Err(undo) => {
                    self.failed.store(true, Ordering::Release);
                    tracing::error!(
                        error = %e,
                        truncate_error = %undo,
                        "topology log append failed and could not be undone; refusing writes"
                    );
                }
            }
            return Err(e.into());
        }

        let mut data = self.data.write().map_err(poisoned)?;
        match record {
            LogRecord::Put { key, value } => {
                data.insert(key, value);
            }
            LogRecord::Delete { key } => {
                data.remove(&key);
            }
        }
        Ok(())
    }

    fn write_frame(&self, log: &mut File, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        {
            let fault = self
                .fault
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(fault) = fault {
                return fault.inject(log, buf);
            }
        }
        log.write_all(buf)?;
        log.sync_data()
    }
}

fn poisoned<E>(_: E) -> StoreError {
    StoreError::Corrupt("file store lock poisoned".to_string())
}

/// Applies every complete record in `path` to `data` and returns the byte
/// length of the valid prefix.
fn replay(path: &Path, data: &mut BTreeMap<Key, Value>) -> Result<u64, StoreError> {
    let mut contents = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut contents)?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    }

    let mut offset = 0usize;
    while contents.len() - offset >= 4 {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&contents[offset..offset + 4]);
        let len = u32::from_le_bytes(len_buf) as usize;
        let start = offset + 4;
        if contents.len() - start < len {
            break;
        }

        let record: LogRecord = bincode::deserialize(&contents[start..start + len])
            .map_err(|e| StoreError::Corrupt(format!("bad record at offset {}: {}", offset, e)))?;
        match record {
            LogRecord::Put { key, value } => {
                data.insert(key, value);
            }
            LogRecord::Delete { key } => {
                data.remove(&key);
            }
        }
        offset = start + len;
    }
    Ok(offset as u64)
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), StoreError> {
        self.append(LogRecord::Put { key, value })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.append(LogRecord::Delete { key: key.to_vec() })
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(scan_map_prefix(&data, prefix))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Failure injected into the next append.
    pub(super) enum Fault {
        /// Half the frame reaches the file, then the write fails.
        ShortWrite,
        /// The whole frame is written but the sync fails.
        Sync,
    }

    impl Fault {
        pub(super) fn inject(self, log: &mut File, buf: &[u8]) -> io::Result<()> {
            match self {
                Fault::ShortWrite => log.write_all(&buf[..buf.len() / 2])?,
                Fault::Sync => log.write_all(buf)?,
            }
            Err(io::Error::other("injected append failure"))
        }
    }

    fn inject(store: &FileKvStore, fault: Fault) {
        *store.fault.lock().unwrap() = Some(fault);
    }

    #[test]
    fn test_failed_append_leaves_log_readable() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            store.put(b"a".to_vec(), b"1".to_vec()).unwrap();

            inject(&store, Fault::ShortWrite);
            assert!(store.put(b"x".to_vec(), b"lost".to_vec()).is_err());
            assert_eq!(store.get(b"x").unwrap(), None);

            store.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            store.put(b"c".to_vec(), b"3".to_vec()).unwrap();
        }

        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"c").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(b"x").unwrap(), None);
    }

    #[test]
    fn test_failed_sync_does_not_resurface_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            inject(&store, Fault::Sync);
            assert!(store.put(b"k".to_vec(), b"rejected".to_vec()).is_err());
            store.delete(b"other").unwrap();
        }

        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_second_open_of_locked_dir_fails() {
        let dir = TempDir::new().unwrap();
        let first = FileKvStore::open(dir.path()).unwrap();
        first.put(b"a".to_vec(), b"1".to_vec()).unwrap();

        assert!(matches!(
            FileKvStore::open(dir.path()),
            Err(StoreError::Locked(_))
        ));
        first.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        drop(first);

        let second = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(second.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_reopen_replays_puts_and_deletes() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            store.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            store.put(b"a".to_vec(), b"3".to_vec()).unwrap();
            store.delete(b"b").unwrap();
        }

        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        }
        let log_path = dir.path().join(LOG_FILENAME);
        let good_len = fs::metadata(&log_path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&log_path).unwrap();
            f.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        }

        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(fs::metadata(&log_path).unwrap().len(), good_len);

        store.put(b"k2".to_vec(), b"v2".to_vec()).unwrap();
        drop(store);
        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_compact_keeps_live_keys_only() {
        let dir = TempDir::new().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        for i in 0..50u32 {
            store.put(b"hot".to_vec(), i.to_le_bytes().to_vec()).unwrap();
        }
        store.put(b"gone".to_vec(), b"x".to_vec()).unwrap();
        store.delete(b"gone").unwrap();

        let log_path = dir.path().join(LOG_FILENAME);
        let before = fs::metadata(&log_path).unwrap().len();
        store.compact().unwrap();
        let after = fs::metadata(&log_path).unwrap().len();
        assert!(after < before);

        store.put(b"new".to_vec(), b"y".to_vec()).unwrap();
        drop(store);

        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"hot").unwrap(), Some(49u32.to_le_bytes().to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
        assert_eq!(store.get(b"new").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_scan_prefix() {
        let dir = TempDir::new().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.put(b"zone/1".to_vec(), b"a".to_vec()).unwrap();
        store.put(b"zone/2".to_vec(), b"b".to_vec()).unwrap();
        store.put(b"server/1".to_vec(), b"c".to_vec()).unwrap();
        assert_eq!(store.scan_prefix(b"zone/").unwrap().len(), 2);
        assert!(store.contains_key(b"server/1").unwrap());
    }
}
