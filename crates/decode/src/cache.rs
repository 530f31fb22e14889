use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use vox_transport::{AudioArc, AudioRef, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Raw,
    Processed,
}

impl BufferKind {
    /// ByteCache key for `source` when read as this kind of buffer.
    pub fn cache_key(&self, source: &AudioRef) -> String {
        format!("{self}:{source}")
    }
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferKind::Raw => f.write_str("raw"),
            BufferKind::Processed => f.write_str("processed"),
        }
    }
}

/// Decoded buffers of one track.
#[derive(Debug, Clone, Default)]
pub struct BufferEntry {
    pub raw: Option<AudioArc>,
    pub processed: Option<AudioArc>,
}

impl BufferEntry {
    pub fn get(&self, kind: BufferKind) -> Option<&AudioArc> {
        match kind {
            BufferKind::Raw => self.raw.as_ref(),
            BufferKind::Processed => self.processed.as_ref(),
        }
    }

    fn slot(&mut self, kind: BufferKind) -> &mut Option<AudioArc> {
        match kind {
            BufferKind::Raw => &mut self.raw,
            BufferKind::Processed => &mut self.processed,
        }
    }
}

/// trackId → decoded raw/processed buffers.
#[derive(Debug, Clone, Default)]
pub struct DecodedBufferCache {
    entries: Arc<Mutex<HashMap<TrackId, BufferEntry>>>,
}

impl DecodedBufferCache {
    pub fn get(&self, track: &TrackId) -> BufferEntry {
        self.entries.lock().get(track).cloned().unwrap_or_default()
    }

    pub fn contains(&self, track: &TrackId, kind: BufferKind) -> bool {
        self.entries
            .lock()
            .get(track)
            .is_some_and(|entry| entry.get(kind).is_some())
    }

    pub fn set(&self, track: &TrackId, kind: BufferKind, audio: Option<AudioArc>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(track.clone()).or_default();
        *entry.slot(kind) = audio;
    }

    pub fn remove(&self, track: &TrackId) {
        self.entries.lock().remove(track);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// resourceKey → encoded bytes, so that buffers can be decoded again for a new
/// audio context without refetching.
#[derive(Debug, Clone, Default)]
pub struct ByteCache {
    entries: Arc<Mutex<HashMap<String, Arc<[u8]>>>>,
}

impl ByteCache {
    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, bytes: Arc<[u8]>) {
        self.entries.lock().insert(key, bytes);
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The process-wide caches. Owned by the application root and handed to the
/// engine, so they outlive any single view of the tracks; `clear()` is for a
/// full reload only.
#[derive(Debug, Clone, Default)]
pub struct BufferCaches {
    pub decoded: DecodedBufferCache,
    pub bytes: ByteCache,
}

impl BufferCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.decoded.clear();
        self.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_created_lazily() {
        let cache = DecodedBufferCache::default();
        let id = TrackId::from("t1");

        assert!(cache.get(&id).raw.is_none());
        assert!(cache.is_empty());

        cache.set(&id, BufferKind::Raw, Some(AudioArc::constant(0.0, 10, 44100, 1)));
        assert!(cache.contains(&id, BufferKind::Raw));
        assert!(!cache.contains(&id, BufferKind::Processed));
    }

    #[test]
    fn test_clones_share_state() {
        let caches = BufferCaches::new();
        let remount = caches.clone();

        caches.bytes.insert("raw:blob:x".into(), Arc::from(&b"abc"[..]));
        assert!(remount.bytes.contains("raw:blob:x"));

        remount.clear();
        assert!(caches.bytes.is_empty());
    }

    #[test]
    fn test_cache_key_distinguishes_kinds() {
        let source = AudioRef::from("/api/download/mixed-track?id=1");
        assert_ne!(
            BufferKind::Raw.cache_key(&source),
            BufferKind::Processed.cache_key(&source)
        );
        assert_eq!(
            BufferKind::Processed.cache_key(&source),
            "processed:/api/download/mixed-track?id=1"
        );
    }
}
