//! Append-only journal store.
//!
//! The journal is a single file of framed batches. Each frame is the
//! batch payload length, the payload, and the first four bytes of the
//! payload's double-SHA256. A frame is visible only once fully
//! written, so a crash mid-append loses at most the torn tail. The
//! live key/value state is replayed into memory on open; `compact`
//! rewrites the file from live state and truncates the history.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use sha2::{Digest, Sha256};

use crate::{KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

const JOURNAL_MAGIC: [u8; 4] = *b"VJN1";
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Outcome of replaying the journal on open.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadReport {
    pub batches: usize,
    pub records: usize,
    /// True when a torn or corrupt tail was discarded; the caller
    /// should compact to drop the bad region from disk.
    pub needs_rewrite: bool,
}

pub struct JournalStore {
    path: PathBuf,
    file: Mutex<File>,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl JournalStore {
    pub fn open(path: &Path) -> Result<(Self, LoadReport), StoreError> {
        let mut report = LoadReport::default();
        let mut map = BTreeMap::new();
        let mut valid_len = JOURNAL_MAGIC.len() as u64;

        let existing = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        match existing {
            Some(bytes) => {
                if bytes.len() < JOURNAL_MAGIC.len() || bytes[..4] != JOURNAL_MAGIC {
                    return Err(StoreError::Corrupt("bad journal magic"));
                }
                let mut cursor = JOURNAL_MAGIC.len();
                loop {
                    match read_frame(&bytes, cursor) {
                        FrameResult::Frame { payload, next } => {
                            match replay_payload(payload, &mut map) {
                                Ok(records) => {
                                    report.batches += 1;
                                    report.records += records;
                                    cursor = next;
                                    valid_len = cursor as u64;
                                }
                                Err(_) => {
                                    report.needs_rewrite = true;
                                    break;
                                }
                            }
                        }
                        FrameResult::End => break,
                        FrameResult::Torn => {
                            report.needs_rewrite = true;
                            break;
                        }
                    }
                }
            }
            None => {
                let mut file = File::create(path)?;
                file.write_all(&JOURNAL_MAGIC)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().read(true).append(true).open(path)?;
        // Drop anything after the last intact frame so new appends do
        // not land behind a torn one.
        if report.needs_rewrite {
            file.set_len(valid_len)?;
        }

        let store = Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            map: RwLock::new(map),
        };
        Ok((store, report))
    }

    /// Rewrites the journal as a single batch of the live state.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut file_guard = self.file.lock().expect("journal file lock");
        let map_guard = self.map.read().expect("journal map lock");

        let mut payload = Vec::new();
        for (key, value) in map_guard.iter() {
            payload.push(OP_PUT);
            write_varint(&mut payload, key.len() as u64);
            payload.extend_from_slice(key);
            write_varint(&mut payload, value.len() as u64);
            payload.extend_from_slice(value);
        }

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&JOURNAL_MAGIC)?;
        if !payload.is_empty() {
            write_frame(&mut tmp, &payload)?;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        *file_guard = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_ops(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut payload = Vec::new();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    payload.push(OP_PUT);
                    write_varint(&mut payload, key.as_slice().len() as u64);
                    payload.extend_from_slice(key.as_slice());
                    write_varint(&mut payload, value.as_slice().len() as u64);
                    payload.extend_from_slice(value.as_slice());
                }
                WriteOp::Delete { key } => {
                    payload.push(OP_DELETE);
                    write_varint(&mut payload, key.as_slice().len() as u64);
                    payload.extend_from_slice(key.as_slice());
                }
            }
        }
        if payload.is_empty() {
            return Ok(());
        }

        let mut file_guard = self.file.lock().expect("journal file lock");
        write_frame(&mut *file_guard, &payload)?;

        let mut map_guard = self.map.write().expect("journal map lock");
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    map_guard.insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { key } => {
                    map_guard.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

impl KeyValueStore for JournalStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.map.read().expect("journal map lock");
        Ok(guard.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.append_ops(&[WriteOp::Put {
            key: key.into(),
            value: value.into(),
        }])
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.append_ops(&[WriteOp::Delete { key: key.into() }])
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.map.read().expect("journal map lock");
        let mut results = Vec::new();
        for (key, value) in guard.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let ops: Vec<WriteOp> = batch.iter().cloned().collect();
        self.append_ops(&ops)
    }

    fn flush(&self, _shutdown: bool) -> Result<(), StoreError> {
        let guard = self.file.lock().expect("journal file lock");
        guard.sync_all()?;
        Ok(())
    }
}

enum FrameResult<'a> {
    Frame { payload: &'a [u8], next: usize },
    End,
    Torn,
}

fn read_frame(bytes: &[u8], cursor: usize) -> FrameResult<'_> {
    if cursor == bytes.len() {
        return FrameResult::End;
    }
    if bytes.len() - cursor < 4 {
        return FrameResult::Torn;
    }
    let len = u32::from_le_bytes([
        bytes[cursor],
        bytes[cursor + 1],
        bytes[cursor + 2],
        bytes[cursor + 3],
    ]) as usize;
    let body_start = cursor + 4;
    if bytes.len() - body_start < len + 4 {
        return FrameResult::Torn;
    }
    let payload = &bytes[body_start..body_start + len];
    let stored = &bytes[body_start + len..body_start + len + 4];
    if checksum(payload) != stored {
        return FrameResult::Torn;
    }
    FrameResult::Frame {
        payload,
        next: body_start + len + 4,
    }
}

fn write_frame(file: &mut File, payload: &[u8]) -> Result<(), StoreError> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&checksum(payload));
    file.write_all(&frame)?;
    Ok(())
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    [second[0], second[1], second[2], second[3]]
}

fn replay_payload(payload: &[u8], map: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<usize, ()> {
    let mut cursor = 0usize;
    let mut records = 0usize;
    while cursor < payload.len() {
        let op = payload[cursor];
        cursor += 1;
        let (key_len, used) = read_varint(&payload[cursor..]).ok_or(())?;
        cursor += used;
        let key_len = key_len as usize;
        if payload.len() - cursor < key_len {
            return Err(());
        }
        let key = payload[cursor..cursor + key_len].to_vec();
        cursor += key_len;
        match op {
            OP_PUT => {
                let (value_len, used) = read_varint(&payload[cursor..]).ok_or(())?;
                cursor += used;
                let value_len = value_len as usize;
                if payload.len() - cursor < value_len {
                    return Err(());
                }
                let value = payload[cursor..cursor + value_len].to_vec();
                cursor += value_len;
                map.insert(key, value);
            }
            OP_DELETE => {
                map.remove(&key);
            }
            _ => return Err(()),
        }
        records += 1;
    }
    Ok(records)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (index, byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_journal(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("{name}-{}-{nanos}.journal", std::process::id()))
    }

    #[test]
    fn roundtrip_across_reopen() {
        let path = temp_journal("journal-roundtrip");
        {
            let (store, report) = JournalStore::open(&path).expect("open");
            assert_eq!(report.records, 0);
            store.put(b"tx\x01", b"one").expect("put");
            store.put(b"key\x02", b"two").expect("put");
            store.delete(b"tx\x01").expect("delete");
            store.flush(true).expect("flush");
        }
        let (store, report) = JournalStore::open(&path).expect("reopen");
        assert!(!report.needs_rewrite);
        assert_eq!(report.records, 3);
        assert_eq!(store.get(b"tx\x01").expect("get"), None);
        assert_eq!(store.get(b"key\x02").expect("get"), Some(b"two".to_vec()));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn batch_is_atomic_in_one_frame() {
        let path = temp_journal("journal-batch");
        let (store, _) = JournalStore::open(&path).expect("open");
        let mut batch = WriteBatch::new();
        batch.put(b"a".as_slice(), b"1".as_slice());
        batch.put(b"b".as_slice(), b"2".as_slice());
        batch.delete(b"a".as_slice());
        store.write_batch(&batch).expect("batch");
        assert_eq!(store.get(b"a").expect("get"), None);
        assert_eq!(store.get(b"b").expect("get"), Some(b"2".to_vec()));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn torn_tail_is_recovered() {
        let path = temp_journal("journal-torn");
        {
            let (store, _) = JournalStore::open(&path).expect("open");
            store.put(b"keep", b"me").expect("put");
            store.flush(true).expect("flush");
        }
        // Append garbage that looks like the start of a frame.
        let mut file = OpenOptions::new().append(true).open(&path).expect("append");
        file.write_all(&[0xff, 0x00, 0x00, 0x00, 0x01, 0x02]).expect("write");
        drop(file);

        let (store, report) = JournalStore::open(&path).expect("reopen");
        assert!(report.needs_rewrite);
        assert_eq!(store.get(b"keep").expect("get"), Some(b"me".to_vec()));

        // After recovery new writes land cleanly.
        store.put(b"fresh", b"write").expect("put");
        drop(store);
        let (store, report) = JournalStore::open(&path).expect("reopen after recovery");
        assert!(!report.needs_rewrite);
        assert_eq!(store.get(b"fresh").expect("get"), Some(b"write".to_vec()));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn compact_drops_history() {
        let path = temp_journal("journal-compact");
        let (store, _) = JournalStore::open(&path).expect("open");
        for index in 0..50u8 {
            store.put(&[b'k', index], &[index]).expect("put");
        }
        for index in 0..25u8 {
            store.delete(&[b'k', index]).expect("delete");
        }
        let before = fs::metadata(&path).expect("meta").len();
        store.compact().expect("compact");
        let after = fs::metadata(&path).expect("meta").len();
        assert!(after < before);

        drop(store);
        let (store, report) = JournalStore::open(&path).expect("reopen");
        assert!(!report.needs_rewrite);
        assert_eq!(report.batches, 1);
        assert_eq!(store.scan_prefix(b"k").expect("scan").len(), 25);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn scan_prefix_is_ordered() {
        let path = temp_journal("journal-scan");
        let (store, _) = JournalStore::open(&path).expect("open");
        store.put(b"pool\x00\x02", b"b").expect("put");
        store.put(b"pool\x00\x01", b"a").expect("put");
        store.put(b"tx\x00", b"other").expect("put");
        let entries = store.scan_prefix(b"pool").expect("scan");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].0 < entries[1].0);
        fs::remove_file(&path).ok();
    }
}
