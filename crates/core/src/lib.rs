//! Multi-track playback for the vocal mixing studio: synchronized scheduling,
//! instant raw/processed switching, output activation and the mix backend.

pub mod config;
pub mod error;
pub mod mixer;
pub mod output;
pub mod progress;
pub mod route;
pub mod service;
pub mod session;
pub mod studio;
pub mod unlock;

pub use config::{RoutePreference, StudioConfig};
pub use error::{StudioError, normalize_mix_error};
pub use mixer::{PlayableTrack, TrackNodes, branch_levels};
pub use output::{Activation, PlaybackOutput};
pub use progress::{MixProgress, ProgressMap};
pub use route::{DirectRoute, MediaElementRoute, OutputRoute, Platform, RouteKind, route_for};
pub use service::{
    HttpMixService, JobStatus, MasterRequest, MasterResult, MasterTrackSpec, MixRequest, MixService,
    MixSubmission, ServiceError,
};
pub use session::{PlaybackScheduler, PlaybackState, PollOutcome, SchedulerTiming, SeekOutcome};
pub use studio::{MasterPreview, MixFinished, MixJob, RenderJob, Studio, StudioDeps};
pub use unlock::AudioUnlockManager;

pub use vox_decode::{BufferCaches, ObjectUrls, decode_file};
pub use vox_engine::{
    AudioContext, AudioError, ContextFactory, CpalContextFactory, OfflineContextFactory,
};
pub use vox_project::{FileDurableStore, MemoryDurableStore, MemoryEphemeralStore};
pub use vox_transport::{
    AudioArc, Category, MixParams, PlayMode, Track, TrackId, WAVEFORM_POINTS, WaveformData,
    compute_peaks,
};
