//! Realtime audio graph: a clocked context that mixes one-shot buffer sources
//! through gain buses into an output device (or into memory when offline).

mod context;
mod device;
mod factory;
mod media;
mod renderer;

pub use context::AudioContext;
pub use factory::{ContextFactory, CpalContextFactory, OfflineContextFactory};
pub use media::{CaptureElement, CpalMediaElement, MediaElement, MediaSource, StreamReceiver};
pub use renderer::RENDER_QUANTUM;

use tokio::sync::oneshot;
use vox_transport::AudioArc;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no output device available")]
    NoDevice,

    #[error("unsupported sample format '{0}'")]
    UnsupportedFormat(String),

    #[error("could not query output config: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),

    #[error("could not open output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),

    #[error("could not start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),

    #[error("could not pause output stream: {0}")]
    Pause(#[from] cpal::PauseStreamError),

    #[error("audio context is closed")]
    Closed,

    #[error("audio command queue is full")]
    QueueFull,

    #[error("unknown bus {0}")]
    UnknownBus(BusId),

    #[error("operation needs an offline context")]
    NotOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Suspended = 0,
    Running = 1,
    Closed = 2,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContextState::Suspended,
            1 => ContextState::Running,
            _ => ContextState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId(u64);

impl BusId {
    /// The context's hardware output.
    pub const DESTINATION: BusId = BusId(0);
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// Where a gain bus sends its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOutput {
    Destination,
    Bus(BusId),
    /// A stream destination; see [`AudioContext::create_stream_destination`].
    Stream,
}

/// A one-shot buffer source to start.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub buffer: AudioArc,
    pub bus: BusId,
    /// Context time in seconds; times in the past start at the next quantum.
    pub when: f64,
    /// Seconds into the buffer.
    pub offset: f64,
}

/// Resolved when a source played to the end of its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ended {
    pub frame: u64,
}

/// A started source. Dropping the handle does not stop the source.
#[derive(Debug)]
pub struct SourceHandle {
    pub id: SourceId,
    pub when: f64,
    pub offset: f64,
    /// Closed without a value if the source was stopped early.
    pub completion: oneshot::Receiver<Ended>,
}
