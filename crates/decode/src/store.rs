use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use vox_transport::{AudioArc, AudioRef, TrackId};

use crate::{
    BufferCaches, BufferEntry, BufferKind, ByteFetcher, DecodeError, FetchError, decode_bytes,
};

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("could not load {kind} audio for track {track}: {source}")]
    Load {
        track: TrackId,
        kind: BufferKind,
        source: FetchError,
    },

    #[error("could not decode {kind} audio for track {track}: {source}")]
    Decode {
        track: TrackId,
        kind: BufferKind,
        source: DecodeError,
    },
}

impl BufferError {
    pub fn track(&self) -> &TrackId {
        match self {
            BufferError::Load { track, .. } | BufferError::Decode { track, .. } => track,
        }
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            BufferError::Load { kind, .. } | BufferError::Decode { kind, .. } => *kind,
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(self, BufferError::Load { .. })
    }
}

/// What one track needs decoded before it can be scheduled.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub track: TrackId,
    pub raw: Option<AudioRef>,
    pub processed: Option<AudioRef>,
}

#[derive(Debug, Default)]
struct TrackBookkeeping {
    byte_keys: Vec<String>,
    /// Bumped on invalidation; a decode that started under an older generation
    /// does not write its result back.
    generation: u64,
}

/// Fetches, decodes and caches per-track audio.
///
/// Only the store mutates the caches; readers take cheap snapshots with
/// [`BufferStore::get_decoded`].
pub struct BufferStore {
    caches: BufferCaches,
    fetcher: Arc<dyn ByteFetcher>,
    /// Decoded buffers are converted to this rate; 0 keeps the file's own rate.
    target_rate: AtomicU32,
    tracks: Mutex<HashMap<TrackId, TrackBookkeeping>>,
}

impl BufferStore {
    pub fn new(caches: BufferCaches, fetcher: Arc<dyn ByteFetcher>) -> Self {
        Self {
            caches,
            fetcher,
            target_rate: AtomicU32::new(0),
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub fn caches(&self) -> &BufferCaches {
        &self.caches
    }

    pub fn target_sample_rate(&self) -> Option<u32> {
        match self.target_rate.load(Ordering::Acquire) {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Switch the playback sample rate. Decoded buffers at the old rate are
    /// dropped; the encoded bytes stay cached so the next `ensure_decoded`
    /// decodes again without fetching. Returns true when anything changed.
    pub fn set_target_sample_rate(&self, rate: u32) -> bool {
        let previous = self.target_rate.swap(rate, Ordering::AcqRel);
        if previous == rate {
            return false;
        }
        if previous != 0 {
            log::info!("sample rate changed {previous} -> {rate} Hz, dropping decoded buffers");
            self.caches.decoded.clear();
            for book in self.tracks.lock().values_mut() {
                book.generation += 1;
            }
        }
        true
    }

    /// Make sure the raw (and, if given, processed) buffers of `track` are
    /// decoded. Already decoded buffers are skipped, so this is cheap to call
    /// before every play.
    pub async fn ensure_decoded(
        &self,
        track: &TrackId,
        raw: Option<&AudioRef>,
        processed: Option<&AudioRef>,
    ) -> Result<(), BufferError> {
        if let Some(source) = raw {
            self.ensure_kind(track, BufferKind::Raw, source).await?;
        }
        if let Some(source) = processed {
            self.ensure_kind(track, BufferKind::Processed, source).await?;
        }
        Ok(())
    }

    /// Fan out `ensure_decoded` over several tracks; fails as soon as one fails.
    pub async fn ensure_all(&self, requests: &[LoadRequest]) -> Result<(), BufferError> {
        try_join_all(requests.iter().map(|request| {
            self.ensure_decoded(&request.track, request.raw.as_ref(), request.processed.as_ref())
        }))
        .await?;
        Ok(())
    }

    pub fn get_decoded(&self, track: &TrackId) -> BufferEntry {
        self.caches.decoded.get(track)
    }

    /// Prime the byte cache with bytes the caller already holds, e.g. a file
    /// the user just selected.
    pub fn insert_bytes(
        &self,
        track: &TrackId,
        kind: BufferKind,
        source: &AudioRef,
        bytes: Arc<[u8]>,
    ) {
        let key = kind.cache_key(source);
        self.caches.bytes.insert(key.clone(), bytes);
        self.remember_key(track, key);
    }

    /// Install an already decoded buffer.
    pub fn insert_decoded(&self, track: &TrackId, kind: BufferKind, audio: AudioArc) {
        self.caches.decoded.set(track, kind, Some(audio));
    }

    /// Drop everything cached for a deleted or replaced track.
    pub fn invalidate(&self, track: &TrackId) {
        self.caches.decoded.remove(track);
        let mut tracks = self.tracks.lock();
        if let Some(book) = tracks.get_mut(track) {
            for key in book.byte_keys.drain(..) {
                self.caches.bytes.remove(&key);
            }
            book.generation += 1;
        }
        log::debug!("invalidated buffers of track {track}");
    }

    /// Drop only the processed buffer, before a new mix result replaces it.
    pub fn invalidate_processed(&self, track: &TrackId) {
        self.caches.decoded.set(track, BufferKind::Processed, None);
        let mut tracks = self.tracks.lock();
        if let Some(book) = tracks.get_mut(track) {
            let prefix = format!("{}:", BufferKind::Processed);
            book.byte_keys.retain(|key| {
                let stale = key.starts_with(&prefix);
                if stale {
                    self.caches.bytes.remove(key);
                }
                !stale
            });
        }
    }

    async fn ensure_kind(
        &self,
        track: &TrackId,
        kind: BufferKind,
        source: &AudioRef,
    ) -> Result<(), BufferError> {
        if self.caches.decoded.contains(track, kind) {
            return Ok(());
        }
        let generation = self.generation(track);

        let bytes = self.bytes_for(track, kind, source).await?;
        let target_rate = self.target_sample_rate();

        let decoded = tokio::task::spawn_blocking(move || -> Result<AudioArc, DecodeError> {
            let audio = decode_bytes(bytes, None)?;
            match target_rate {
                Some(rate) => audio
                    .resample(rate)
                    .map_err(|e| DecodeError::Resample(e.to_string())),
                None => Ok(audio),
            }
        })
        .await
        .map_err(|_| DecodeError::Interrupted)
        .and_then(|result| result)
        .map_err(|source| BufferError::Decode {
            track: track.clone(),
            kind,
            source,
        })?;

        if self.generation(track) != generation {
            log::debug!("discarding {kind} decode of track {track}: invalidated meanwhile");
            return Ok(());
        }

        // a concurrent request may have won the race; the buffers are identical
        log::debug!("decoded {kind} audio of track {track}: {decoded:?}");
        self.caches.decoded.set(track, kind, Some(decoded));
        Ok(())
    }

    async fn bytes_for(
        &self,
        track: &TrackId,
        kind: BufferKind,
        source: &AudioRef,
    ) -> Result<Arc<[u8]>, BufferError> {
        let key = kind.cache_key(source);
        if let Some(bytes) = self.caches.bytes.get(&key) {
            return Ok(bytes);
        }

        let bytes = self
            .fetcher
            .fetch(source)
            .await
            .map_err(|source| BufferError::Load {
                track: track.clone(),
                kind,
                source,
            })?;
        self.caches.bytes.insert(key.clone(), bytes.clone());
        self.remember_key(track, key);
        Ok(bytes)
    }

    fn remember_key(&self, track: &TrackId, key: String) {
        let mut tracks = self.tracks.lock();
        let book = tracks.entry(track.clone()).or_default();
        if !book.byte_keys.contains(&key) {
            book.byte_keys.push(key);
        }
    }

    fn generation(&self, track: &TrackId) -> u64 {
        self.tracks.lock().get(track).map_or(0, |book| book.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxFuture, ObjectUrls, SourceFetcher, wav_bytes};
    use std::sync::atomic::AtomicUsize;

    /// Serves fixed bytes for remote references and counts requests.
    struct CountingFetcher {
        bytes: Arc<[u8]>,
        requests: AtomicUsize,
    }

    impl ByteFetcher for CountingFetcher {
        fn fetch<'a>(
            &'a self,
            source: &'a AudioRef,
        ) -> BoxFuture<'a, Result<Arc<[u8]>, FetchError>> {
            Box::pin(async move {
                self.requests.fetch_add(1, Ordering::SeqCst);
                match source {
                    AudioRef::Remote(url) if url.contains("missing") => Err(FetchError::Status {
                        url: url.clone(),
                        status: 404,
                    }),
                    _ => Ok(self.bytes.clone()),
                }
            })
        }
    }

    fn store_with(bytes: Arc<[u8]>) -> (BufferStore, Arc<CountingFetcher>) {
        let fetcher = Arc::new(CountingFetcher {
            bytes,
            requests: AtomicUsize::new(0),
        });
        (BufferStore::new(BufferCaches::new(), fetcher.clone()), fetcher)
    }

    #[tokio::test]
    async fn test_ensure_decoded_is_idempotent() {
        let (store, fetcher) = store_with(wav_bytes(&[0.5; 4410], 44100, 1));
        let id = TrackId::from("vox");
        let raw = AudioRef::from("/raw.wav");

        store.ensure_decoded(&id, Some(&raw), None).await.expect("first");
        store.ensure_decoded(&id, Some(&raw), None).await.expect("second");

        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 1);
        let entry = store.get_decoded(&id);
        assert_eq!(entry.raw.expect("raw").frames(), 4410);
        assert!(entry.processed.is_none());
    }

    #[tokio::test]
    async fn test_processed_buffer_is_decoded_alongside_raw() {
        let (store, _) = store_with(wav_bytes(&[0.1; 100], 44100, 2));
        let id = TrackId::from("vox");

        store
            .ensure_decoded(&id, Some(&"/raw.wav".into()), Some(&"/mixed.wav".into()))
            .await
            .expect("decode");

        let entry = store.get_decoded(&id);
        assert!(entry.raw.is_some());
        assert!(entry.processed.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_source_is_a_load_error() {
        let (store, _) = store_with(wav_bytes(&[0.0; 10], 44100, 1));
        let id = TrackId::from("gone");

        let err = store
            .ensure_decoded(&id, Some(&"/missing.wav".into()), None)
            .await
            .unwrap_err();
        assert!(err.is_load());
        assert_eq!(err.track(), &id);
    }

    #[tokio::test]
    async fn test_corrupt_bytes_are_a_decode_error() {
        let (store, _) = store_with(Arc::from(&b"definitely not audio"[..]));
        let err = store
            .ensure_decoded(&TrackId::from("bad"), Some(&"/bad.wav".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BufferError::Decode { kind: BufferKind::Raw, .. }));
    }

    #[tokio::test]
    async fn test_stale_object_reference_fails_to_load() {
        let objects = ObjectUrls::new();
        let fetcher = Arc::new(SourceFetcher::new(objects.clone(), "http://127.0.0.1:1"));
        let store = BufferStore::new(BufferCaches::new(), fetcher);

        let stale = ObjectUrls::new().create(wav_bytes(&[0.0; 10], 44100, 1), "old.wav");
        let err = store
            .ensure_decoded(&TrackId::from("t"), Some(&stale), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BufferError::Load { source: FetchError::Stale(_), .. }));
    }

    #[tokio::test]
    async fn test_invalidate_drops_buffers_and_bytes() {
        let (store, fetcher) = store_with(wav_bytes(&[0.2; 100], 44100, 1));
        let id = TrackId::from("t");
        let raw = AudioRef::from("/raw.wav");

        store.ensure_decoded(&id, Some(&raw), None).await.expect("decode");
        store.invalidate(&id);

        assert!(store.get_decoded(&id).raw.is_none());
        assert!(store.caches().bytes.is_empty());

        store.ensure_decoded(&id, Some(&raw), None).await.expect("decode again");
        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retargeting_redecodes_from_byte_cache() {
        let (store, fetcher) = store_with(wav_bytes(&[0.3; 4410], 44100, 1));
        let id = TrackId::from("t");
        let raw = AudioRef::from("/raw.wav");

        store.set_target_sample_rate(44100);
        store.ensure_decoded(&id, Some(&raw), None).await.expect("decode");
        assert_eq!(store.get_decoded(&id).raw.unwrap().sample_rate(), 44100);

        assert!(store.set_target_sample_rate(48000));
        assert!(store.get_decoded(&id).raw.is_none());

        store.ensure_decoded(&id, Some(&raw), None).await.expect("redecode");
        assert_eq!(store.get_decoded(&id).raw.unwrap().sample_rate(), 48000);
        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_all_fails_when_any_track_fails() {
        let (store, _) = store_with(wav_bytes(&[0.0; 100], 44100, 1));
        let requests = vec![
            LoadRequest {
                track: TrackId::from("ok"),
                raw: Some("/ok.wav".into()),
                processed: None,
            },
            LoadRequest {
                track: TrackId::from("broken"),
                raw: Some("/missing.wav".into()),
                processed: None,
            },
        ];

        let err = store.ensure_all(&requests).await.unwrap_err();
        assert_eq!(err.track(), &TrackId::from("broken"));
    }

    #[tokio::test]
    async fn test_invalidate_processed_keeps_raw() {
        let (store, _) = store_with(wav_bytes(&[0.0; 100], 44100, 1));
        let id = TrackId::from("t");
        store
            .ensure_decoded(&id, Some(&"/raw.wav".into()), Some(&"/mix.wav".into()))
            .await
            .expect("decode");

        store.invalidate_processed(&id);

        let entry = store.get_decoded(&id);
        assert!(entry.raw.is_some());
        assert!(entry.processed.is_none());
        assert!(store.caches().bytes.contains("raw:/raw.wav"));
        assert!(!store.caches().bytes.contains("processed:/mix.wav"));
    }
}
