use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use vox_transport::{AudioRef, Category, MixParams, PlayMode, Track, TrackId};

use crate::StoreError;

/// Ephemeral-store key holding the track list.
pub const SNAPSHOT_KEY: &str = "vox.tracks";

/// The minimal per-track state carried across navigations. Decoded audio,
/// waveforms and job state are rebuilt from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub category: Category,
    #[serde(default = "default_gain")]
    pub gain: f32,
    #[serde(default)]
    pub mix_params: MixParams,
    #[serde(default, alias = "mixedAudioUrl")]
    pub processed_ref: Option<AudioRef>,
    #[serde(default)]
    pub raw_ref: Option<AudioRef>,
    #[serde(default)]
    pub raw_file_name: Option<String>,
}

fn default_gain() -> f32 {
    100.0
}

impl TrackSnapshot {
    pub fn from_track(track: &Track) -> Self {
        Self {
            id: track.id.clone(),
            category: track.category,
            gain: track.gain(),
            mix_params: track.mix_params.clone(),
            processed_ref: track.processed_ref.clone(),
            raw_ref: track.raw_ref.clone(),
            raw_file_name: track.raw_file_name.clone(),
        }
    }

    /// Rebuild a track. A track that had been mixed comes back in processed
    /// mode, anything else in raw mode.
    pub fn into_track(self) -> Track {
        let mut track = Track::new(self.id, self.category);
        track.set_gain(self.gain);
        track.mix_params = self.mix_params;
        track.play_mode = if self.processed_ref.is_some() {
            PlayMode::Processed
        } else {
            PlayMode::Raw
        };
        track.processed_ref = self.processed_ref;
        track.raw_ref = self.raw_ref;
        track.raw_file_name = self.raw_file_name;
        track
    }
}

pub fn encode_snapshot(tracks: &[Track]) -> Result<String, StoreError> {
    let snapshot: Vec<TrackSnapshot> = tracks.iter().map(TrackSnapshot::from_track).collect();
    Ok(serde_json::to_string(&snapshot)?)
}

/// `None` when there is nothing worth restoring: an empty list, or a value
/// that does not parse.
pub fn decode_snapshot(value: &str) -> Option<Vec<TrackSnapshot>> {
    match serde_json::from_str::<Vec<TrackSnapshot>>(value) {
        Ok(tracks) if tracks.is_empty() => None,
        Ok(tracks) => Some(tracks),
        Err(err) => {
            log::warn!("ignoring unreadable session snapshot: {err}");
            None
        }
    }
}

/// Coalesces bursts of track-list changes into one snapshot write.
///
/// Every change pushes the deadline back; the write happens once the list has
/// been quiet for `delay`.
#[derive(Debug, Clone)]
pub struct SnapshotDebouncer {
    delay: Duration,
    due: Option<Instant>,
}

impl SnapshotDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, due: None }
    }

    pub fn mark_dirty(&mut self, now: Instant) {
        self.due = Some(now + self.delay);
    }

    pub fn is_dirty(&self) -> bool {
        self.due.is_some()
    }

    /// True once per burst, when the quiet period has elapsed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }

    /// Force a pending write, e.g. before shutdown.
    pub fn flush(&mut self) -> bool {
        self.due.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_track() -> Track {
        let mut track = Track::new(TrackId::from("abc123xyz"), Category::LeadVocal);
        track.set_gain(150.0);
        track.raw_ref = Some(AudioRef::from("blob:vox/00ff"));
        track.raw_file_name = Some("verse.wav".into());
        track.processed_ref = Some(AudioRef::from("/api/download/mixed-track?id=42"));
        track
    }

    #[test]
    fn test_snapshot_keeps_minimal_fields() {
        let json = encode_snapshot(&[mixed_track()]).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");

        let entry = &value[0];
        assert_eq!(entry["id"], "abc123xyz");
        assert_eq!(entry["category"], "lead_vocal");
        assert_eq!(entry["gain"], 150.0);
        assert_eq!(entry["rawFileName"], "verse.wav");
        assert_eq!(entry["processedRef"], "/api/download/mixed-track?id=42");
        assert!(entry.get("waveform").is_none());
        assert!(entry.get("playMode").is_none());
    }

    #[test]
    fn test_restore_picks_play_mode_from_processed_ref() {
        let beat = Track::new(TrackId::from("beat"), Category::Instrumental);
        let json = encode_snapshot(&[mixed_track(), beat]).expect("encode");
        let tracks: Vec<Track> = decode_snapshot(&json)
            .expect("snapshot")
            .into_iter()
            .map(TrackSnapshot::into_track)
            .collect();

        assert_eq!(tracks[0].play_mode, PlayMode::Processed);
        assert_eq!(tracks[0].gain(), 150.0);
        assert!(tracks[0].raw_ref.as_ref().is_some_and(AudioRef::is_object));
        assert_eq!(tracks[1].play_mode, PlayMode::Raw);
        assert!(tracks[1].waveform.is_none());
    }

    #[test]
    fn test_legacy_processed_field_name() {
        let json = r#"[{
            "id": "t1",
            "category": "adlibs_backs",
            "gain": 80,
            "mixedAudioUrl": "/mix.wav"
        }]"#;
        let tracks = decode_snapshot(json).expect("snapshot");
        assert_eq!(tracks[0].processed_ref, Some(AudioRef::from("/mix.wav")));
        assert_eq!(tracks[0].mix_params, MixParams::default());
    }

    #[test]
    fn test_empty_or_garbage_snapshot_is_ignored() {
        assert!(decode_snapshot("[]").is_none());
        assert!(decode_snapshot("{not json").is_none());
    }

    #[test]
    fn test_debouncer_waits_for_quiet_period() {
        let start = Instant::now();
        let mut debouncer = SnapshotDebouncer::new(Duration::from_millis(300));
        assert!(!debouncer.poll(start));

        debouncer.mark_dirty(start);
        debouncer.mark_dirty(start + Duration::from_millis(200));
        assert!(!debouncer.poll(start + Duration::from_millis(400)));
        assert!(debouncer.poll(start + Duration::from_millis(500)));
        assert!(!debouncer.poll(start + Duration::from_millis(900)));
    }

    #[test]
    fn test_flush_reports_pending_write() {
        let mut debouncer = SnapshotDebouncer::new(Duration::from_millis(300));
        assert!(!debouncer.flush());
        debouncer.mark_dirty(Instant::now());
        assert!(debouncer.flush());
        assert!(!debouncer.is_dirty());
    }
}
