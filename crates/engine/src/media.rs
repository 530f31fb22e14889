use std::sync::Arc;

use cpal::traits::StreamTrait;
use parking_lot::Mutex;
use vox_transport::AudioArc;

use crate::AudioError;
use crate::device::{OutputDevice, build_output};

/// Consumer end of a stream destination.
pub struct StreamReceiver {
    consumer: rtrb::Consumer<f32>,
    channels: u16,
}

impl StreamReceiver {
    pub(crate) fn new(consumer: rtrb::Consumer<f32>, channels: u16) -> Self {
        Self { consumer, channels }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples waiting to be read.
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    /// Fill `out`, padding with silence when the stream runs dry.
    pub fn read(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            *sample = self.consumer.pop().unwrap_or(0.0);
        }
    }
}

impl std::fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("channels", &self.channels)
            .field("available", &self.available())
            .finish()
    }
}

pub enum MediaSource {
    Stream(StreamReceiver),
    Clip(AudioArc),
}

/// A standalone player with its own path to the speaker, the counterpart of
/// an HTML media element. Some platforms only activate audio output once
/// such an element was played from a user gesture.
pub trait MediaElement {
    fn set_source(&mut self, source: MediaSource);
    fn play(&mut self) -> Result<(), AudioError>;
    fn pause(&mut self);
    fn is_playing(&self) -> bool;
    /// Linear output level, 1.0 by default.
    fn set_volume(&mut self, volume: f32);
}

pub(crate) struct ElementPlayer {
    source: Option<MediaSource>,
    playing: bool,
    volume: f32,
    clip_frame: usize,
    channels: usize,
}

impl ElementPlayer {
    pub(crate) fn new(channels: u16) -> Self {
        Self {
            source: None,
            playing: false,
            volume: 1.0,
            clip_frame: 0,
            channels: channels.max(1) as usize,
        }
    }

    pub(crate) fn fill(&mut self, out: &mut [f32]) {
        if !self.playing {
            out.fill(0.0);
            return;
        }
        match &mut self.source {
            None => out.fill(0.0),
            Some(MediaSource::Stream(stream)) => stream.read(out),
            Some(MediaSource::Clip(clip)) => {
                for frame in out.chunks_mut(self.channels) {
                    if self.clip_frame >= clip.frames() {
                        frame.fill(0.0);
                        continue;
                    }
                    for (ch, sample) in frame.iter_mut().enumerate() {
                        *sample = clip.sample_wrapped(self.clip_frame, ch);
                    }
                    self.clip_frame += 1;
                }
                if self.clip_frame >= clip.frames() {
                    self.playing = false;
                    self.clip_frame = 0;
                }
            }
        }
        if self.volume != 1.0 {
            for sample in out.iter_mut() {
                *sample *= self.volume;
            }
        }
    }

    fn set_source(&mut self, source: MediaSource) {
        self.source = Some(source);
        self.clip_frame = 0;
    }
}

/// In-memory element for offline contexts. Clones share the same player, so
/// a clone kept by the context can be pulled while the original is owned
/// elsewhere.
#[derive(Clone)]
pub struct CaptureElement {
    player: Arc<Mutex<ElementPlayer>>,
    channels: u16,
}

impl CaptureElement {
    pub fn new(channels: u16) -> Self {
        Self {
            player: Arc::new(Mutex::new(ElementPlayer::new(channels))),
            channels,
        }
    }

    /// Advance playback by `frames`, returning what would have reached the
    /// speaker.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * self.channels.max(1) as usize];
        self.player.lock().fill(&mut out);
        out
    }
}

impl MediaElement for CaptureElement {
    fn set_source(&mut self, source: MediaSource) {
        self.player.lock().set_source(source);
    }

    fn play(&mut self) -> Result<(), AudioError> {
        self.player.lock().playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.player.lock().playing = false;
    }

    fn is_playing(&self) -> bool {
        self.player.lock().playing
    }

    fn set_volume(&mut self, volume: f32) {
        self.player.lock().volume = volume.max(0.0);
    }
}

/// Element backed by its own cpal output stream.
pub struct CpalMediaElement {
    player: Arc<Mutex<ElementPlayer>>,
    stream: cpal::Stream,
}

impl CpalMediaElement {
    pub(crate) fn open(output: &OutputDevice) -> Result<Self, AudioError> {
        let player = Arc::new(Mutex::new(ElementPlayer::new(output.channels())));
        let callback_player = player.clone();
        let stream = build_output(output, move |out: &mut [f32]| {
            // never wait on the control thread from the callback
            match callback_player.try_lock() {
                Some(mut player) => player.fill(out),
                None => out.fill(0.0),
            }
        })?;
        Ok(Self { player, stream })
    }
}

impl MediaElement for CpalMediaElement {
    fn set_source(&mut self, source: MediaSource) {
        self.player.lock().set_source(source);
    }

    fn play(&mut self) -> Result<(), AudioError> {
        self.player.lock().playing = true;
        self.stream.play()?;
        Ok(())
    }

    fn pause(&mut self) {
        self.player.lock().playing = false;
        if let Err(err) = self.stream.pause() {
            log::warn!("could not pause media element: {err}");
        }
    }

    fn is_playing(&self) -> bool {
        self.player.lock().playing
    }

    fn set_volume(&mut self, volume: f32) {
        self.player.lock().volume = volume.max(0.0);
    }
}
