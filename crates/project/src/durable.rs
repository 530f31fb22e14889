use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use vox_transport::TrackId;

use crate::StoreError;

const RECORD_EXTENSION: &str = "voxrec";

/// A stored file: its bytes and the name it was selected under.
#[derive(Debug, Clone)]
pub struct DurableRecord {
    pub bytes: Arc<[u8]>,
    pub name: String,
}

/// Raw file bytes keyed by track id, kept across full reloads.
pub trait DurableStore: Send + Sync {
    fn put(&self, id: &TrackId, bytes: &[u8], name: &str) -> Result<(), StoreError>;
    fn get(&self, id: &TrackId) -> Result<Option<DurableRecord>, StoreError>;
    fn delete(&self, id: &TrackId) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    records: Arc<Mutex<HashMap<TrackId, DurableRecord>>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for MemoryDurableStore {
    fn put(&self, id: &TrackId, bytes: &[u8], name: &str) -> Result<(), StoreError> {
        self.records.lock().insert(
            id.clone(),
            DurableRecord {
                bytes: Arc::from(bytes),
                name: name.to_string(),
            },
        );
        Ok(())
    }

    fn get(&self, id: &TrackId) -> Result<Option<DurableRecord>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn delete(&self, id: &TrackId) -> Result<(), StoreError> {
        self.records.lock().remove(id);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.records.lock().clear();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    name: String,
    len: u64,
}

/// One file per track under `root`.
///
/// Layout: little-endian `u32` header length, MessagePack header
/// `{name, len}`, then the payload.
#[derive(Debug, Clone)]
pub struct FileDurableStore {
    root: PathBuf,
}

impl FileDurableStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &TrackId) -> PathBuf {
        let stem: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{stem}.{RECORD_EXTENSION}"))
    }
}

impl DurableStore for FileDurableStore {
    fn put(&self, id: &TrackId, bytes: &[u8], name: &str) -> Result<(), StoreError> {
        let header = rmp_serde::to_vec(&RecordHeader {
            name: name.to_string(),
            len: bytes.len() as u64,
        })?;

        let path = self.record_path(id);
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(&(header.len() as u32).to_le_bytes())?;
            writer.write_all(&header)?;
            writer.write_all(bytes)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;

        log::debug!("stored {} bytes of '{name}' for track {id}", bytes.len());
        Ok(())
    }

    fn get(&self, id: &TrackId) -> Result<Option<DurableRecord>, StoreError> {
        let data = match fs::read(self.record_path(id)) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let corrupt = |reason: &str| StoreError::Corrupt {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let (len_bytes, rest) = data.split_first_chunk::<4>().ok_or_else(|| corrupt("truncated"))?;
        let header_len = u32::from_le_bytes(*len_bytes) as usize;
        if rest.len() < header_len {
            return Err(corrupt("truncated header"));
        }
        let (header, payload) = rest.split_at(header_len);
        let header: RecordHeader = rmp_serde::from_slice(header)?;
        if payload.len() as u64 != header.len {
            return Err(corrupt("payload length mismatch"));
        }

        Ok(Some(DurableRecord {
            bytes: Arc::from(payload),
            name: header.name,
        }))
    }

    fn delete(&self, id: &TrackId) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let store = FileDurableStore::open(dir.path().join("takes")).expect("open");
        let id = TrackId::from("k3j2h1g0f");

        store.put(&id, b"RIFF....WAVE", "verse one.wav").expect("put");
        let record = store.get(&id).expect("get").expect("record");

        assert_eq!(&record.bytes[..], b"RIFF....WAVE");
        assert_eq!(record.name, "verse one.wav");
    }

    #[test]
    fn test_put_replaces_previous_record() {
        let dir = tempdir().expect("tempdir");
        let store = FileDurableStore::open(dir.path()).expect("open");
        let id = TrackId::from("t");

        store.put(&id, b"first", "a.wav").expect("put");
        store.put(&id, b"second take", "b.wav").expect("put");

        let record = store.get(&id).expect("get").expect("record");
        assert_eq!(&record.bytes[..], b"second take");
        assert_eq!(record.name, "b.wav");
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempdir().expect("tempdir");
        let store = FileDurableStore::open(dir.path()).expect("open");
        assert!(store.get(&TrackId::from("nope")).expect("get").is_none());
        store.delete(&TrackId::from("nope")).expect("delete missing");
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let store = FileDurableStore::open(dir.path()).expect("open");
        let id = TrackId::from("t");
        store.put(&id, &[7u8; 64], "a.wav").expect("put");

        let path = store.record_path(&id);
        let data = fs::read(&path).expect("read");
        fs::write(&path, &data[..data.len() - 10]).expect("truncate");

        assert!(matches!(store.get(&id), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_ids_cannot_escape_root() {
        let dir = tempdir().expect("tempdir");
        let store = FileDurableStore::open(dir.path()).expect("open");
        let path = store.record_path(&TrackId::from("../../etc/passwd"));
        assert_eq!(path.parent(), Some(dir.path()));
    }

    #[test]
    fn test_clear_removes_only_records() {
        let dir = tempdir().expect("tempdir");
        let store = FileDurableStore::open(dir.path()).expect("open");
        fs::write(dir.path().join("notes.txt"), "keep").expect("write");
        store.put(&TrackId::from("a"), b"1", "a.wav").expect("put");
        store.put(&TrackId::from("b"), b"2", "b.wav").expect("put");

        store.clear().expect("clear");

        assert!(store.get(&TrackId::from("a")).expect("get").is_none());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryDurableStore::new();
        let shared = store.clone();
        let id = TrackId::from("m");

        store.put(&id, b"abc", "m.wav").expect("put");
        assert_eq!(shared.get(&id).expect("get").expect("record").name, "m.wav");

        shared.delete(&id).expect("delete");
        assert!(store.is_empty());
    }
}
