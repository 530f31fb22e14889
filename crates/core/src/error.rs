use vox_decode::{BufferError, FetchError};
use vox_engine::AudioError;
use vox_project::StoreError;
use vox_transport::TrackId;

use crate::service::ServiceError;

/// Errors surfaced by [`crate::Studio`] operations. The UI turns them into
/// text with [`StudioError::user_message`] and nowhere else.
#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error("could not load audio for track {track}: {reason}")]
    Load { track: TrackId, reason: String },

    #[error("could not decode audio for track {track}: {reason}")]
    Decode { track: TrackId, reason: String },

    #[error("mix job failed: {message}")]
    MixJob {
        track: Option<TrackId>,
        message: String,
    },

    #[error("session expired")]
    Auth,

    #[error("network error: {0}")]
    Network(String),

    #[error("audio output unavailable: {0}")]
    Audio(#[from] AudioError),

    #[error("local storage error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("no track has audio to play")]
    NothingToPlay,

    #[error("{0}")]
    NotReady(&'static str),
}

impl StudioError {
    /// Load, decode, mix and network failures can be retried by the user;
    /// a missing audio output cannot.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StudioError::Audio(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            StudioError::Load { .. } => {
                "The audio file could not be loaded. Select it again and retry.".to_string()
            }
            StudioError::Decode { .. } => {
                "This audio file could not be read. Try a WAV or MP3 file.".to_string()
            }
            StudioError::MixJob { message, .. } => normalize_mix_error(message),
            StudioError::Auth => "Your session expired. Please sign in again.".to_string(),
            StudioError::Network(_) => {
                "The server could not be reached. Check your connection and retry.".to_string()
            }
            StudioError::Audio(_) => "Audio playback is not available on this device.".to_string(),
            StudioError::Store(_) => "The file could not be saved on this device.".to_string(),
            StudioError::UnknownTrack(_) => "This track no longer exists.".to_string(),
            StudioError::NothingToPlay => "Add an audio file to a track first.".to_string(),
            StudioError::NotReady(message) => message.to_string(),
        }
    }
}

/// Turn a raw failure from the mix backend into an actionable hint.
pub fn normalize_mix_error(raw: &str) -> String {
    if raw.contains("3221226505") || raw.contains("0xC0000409") {
        "The mix engine crashed. Try again with a shorter file.".to_string()
    } else if raw.contains("Unable to allocate") || raw.contains("MiB for an array") {
        "The server ran out of memory. Try a shorter audio file (under 2 minutes).".to_string()
    } else if raw.trim().is_empty() {
        "The mix failed. Please retry.".to_string()
    } else {
        raw.to_string()
    }
}

impl From<BufferError> for StudioError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Load { track, kind, source } => match source {
                FetchError::Network(reason) => {
                    log::warn!("network failure loading {kind} audio of {track}: {reason}");
                    StudioError::Network(reason)
                }
                other => StudioError::Load {
                    track,
                    reason: other.to_string(),
                },
            },
            BufferError::Decode { track, source, .. } => StudioError::Decode {
                track,
                reason: source.to_string(),
            },
        }
    }
}

impl From<ServiceError> for StudioError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Auth => StudioError::Auth,
            ServiceError::Network(reason) => StudioError::Network(reason),
            ServiceError::Rejected { message, .. } | ServiceError::InvalidResponse(message) => {
                StudioError::MixJob {
                    track: None,
                    message,
                }
            }
        }
    }
}
