use std::sync::atomic::{AtomicU32, Ordering};

use crate::{AudioContext, AudioError};

/// Creates audio contexts. Mobile platforms want a fresh context per play,
/// so the owner keeps a factory rather than a single context.
pub trait ContextFactory {
    fn create(&self) -> Result<AudioContext, AudioError>;
}

/// Contexts on the default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalContextFactory;

impl ContextFactory for CpalContextFactory {
    fn create(&self) -> Result<AudioContext, AudioError> {
        AudioContext::open_default()
    }
}

/// Deterministic in-memory contexts. They start suspended, like a device
/// context that has not been unlocked yet.
#[derive(Debug)]
pub struct OfflineContextFactory {
    sample_rate: AtomicU32,
    channels: u16,
}

impl OfflineContextFactory {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: AtomicU32::new(sample_rate),
            channels,
        }
    }

    /// Rate of contexts created from now on.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }
}

impl Default for OfflineContextFactory {
    fn default() -> Self {
        Self::new(48000, 2)
    }
}

impl ContextFactory for OfflineContextFactory {
    fn create(&self) -> Result<AudioContext, AudioError> {
        Ok(AudioContext::offline(
            self.sample_rate.load(Ordering::Relaxed),
            self.channels,
            true,
        ))
    }
}

impl<F: ContextFactory + ?Sized> ContextFactory for std::sync::Arc<F> {
    fn create(&self) -> Result<AudioContext, AudioError> {
        (**self).create()
    }
}
