use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use vox_transport::TrackId;

pub type ProgressMap = HashMap<TrackId, u8>;

/// Per-track mix job progress, observable through a watch channel.
///
/// Reported values never go backwards and stay at or below 99 until the
/// processed audio is actually playable. Clones report into the same map.
#[derive(Debug, Clone)]
pub struct MixProgress {
    tx: Arc<watch::Sender<ProgressMap>>,
}

impl Default for MixProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl MixProgress {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressMap::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressMap> {
        self.tx.subscribe()
    }

    pub fn get(&self, track: &TrackId) -> Option<u8> {
        self.tx.borrow().get(track).copied()
    }

    pub fn report(&self, track: &TrackId, percent: f64) {
        let percent = if percent.is_finite() { percent.clamp(0.0, 99.0) as u8 } else { 0 };
        self.tx.send_if_modified(|map| {
            let current = map.entry(track.clone()).or_insert(0);
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    pub fn complete(&self, track: &TrackId) {
        self.tx.send_modify(|map| {
            map.insert(track.clone(), 100);
        });
    }

    pub fn clear(&self, track: &TrackId) {
        self.tx.send_if_modified(|map| map.remove(track).is_some());
    }
}
