use std::f32::consts::PI;
use std::io::Cursor;
use std::sync::Arc;

use vox_engine::{AudioContext, AudioError, BusId, MediaElement, MediaSource, SourceSpec};
use vox_transport::AudioArc;

/// Level of the activation sound. Some engines ignore all-zero buffers, so it
/// has to be real signal, just too quiet to notice.
const ACTIVATION_LEVEL: f32 = 0.01;
const TONE_HZ: f32 = 440.0;
const TONE_SECS: f32 = 0.1;
const CLIP_RATE: u32 = 44100;
const CLIP_FRAMES: usize = 4410;

/// First-gesture audio activation.
///
/// [`AudioUnlockManager::unlock`] must run synchronously inside the gesture,
/// before anything is awaited. It resumes the context, plays a short quiet
/// buffer and tone through it, and plays a tiny generated clip through a media
/// element for engines that only activate on element playback.
#[derive(Default)]
pub struct AudioUnlockManager {
    unlocked: bool,
    element: Option<Box<dyn MediaElement>>,
    clip: Option<AudioArc>,
}

impl AudioUnlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// A new context needs its own activation.
    pub fn rearm(&mut self) {
        self.unlocked = false;
        self.element = None;
    }

    /// Returns true when this call performed the activation, false when the
    /// context was already unlocked.
    pub fn unlock(&mut self, ctx: &mut AudioContext) -> Result<bool, AudioError> {
        if self.unlocked {
            return Ok(false);
        }

        ctx.resume()?;
        let rate = ctx.sample_rate();
        let when = ctx.current_time();

        let frames = ((rate as f64 * 0.05).ceil() as usize).clamp(1, 4096);
        ctx.start_source(SourceSpec {
            buffer: AudioArc::constant(ACTIVATION_LEVEL, frames, rate, 1),
            bus: BusId::DESTINATION,
            when,
            offset: 0.0,
        })?;

        ctx.start_source(SourceSpec {
            buffer: tone(rate, ACTIVATION_LEVEL),
            bus: BusId::DESTINATION,
            when,
            offset: 0.0,
        })?;

        // element activation is best effort; the context path above is what
        // playback depends on
        match self.activation_clip() {
            Some(clip) => match ctx.create_media_element() {
                Ok(mut element) => {
                    element.set_source(MediaSource::Clip(clip));
                    element.set_volume(ACTIVATION_LEVEL);
                    if let Err(err) = element.play() {
                        log::warn!("activation clip did not play: {err}");
                    }
                    self.element = Some(element);
                }
                Err(err) => log::warn!("no media element for activation: {err}"),
            },
            None => log::warn!("could not build activation clip"),
        }

        self.unlocked = true;
        log::info!("audio unlocked at {rate} Hz");
        Ok(true)
    }

    fn activation_clip(&mut self) -> Option<AudioArc> {
        if self.clip.is_none() {
            let bytes = activation_wav().ok()?;
            self.clip = vox_decode::decode_bytes(bytes, Some("wav")).ok();
        }
        self.clip.clone()
    }
}

fn tone(sample_rate: u32, level: f32) -> AudioArc {
    let frames = (sample_rate as f32 * TONE_SECS) as usize;
    let samples = (0..frames)
        .map(|i| level * (2.0 * PI * TONE_HZ * i as f32 / sample_rate as f32).sin())
        .collect();
    AudioArc::new(samples, sample_rate, 1)
}

/// 100ms mono 16-bit WAV whose samples all hold the smallest non-zero value.
fn activation_wav() -> Result<Arc<[u8]>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: CLIP_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for _ in 0..CLIP_FRAMES {
            writer.write_sample(1i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner().into())
}
