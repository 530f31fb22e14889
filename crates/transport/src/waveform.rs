use crate::AudioArc;

/// Number of peaks computed for a track's waveform.
pub const WAVEFORM_POINTS: usize = 200;

/// Peaks of a decoded buffer, used to draw the waveform and to map a click on
/// it back to a playback position.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformData {
    pub peaks: Vec<f32>,
    /// Seconds.
    pub duration: f64,
}

impl WaveformData {
    pub fn from_audio(audio: &AudioArc, num_points: usize) -> Self {
        Self {
            peaks: compute_peaks(audio, num_points),
            duration: audio.duration_secs(),
        }
    }

    /// Offset in seconds for a click at `fraction` (0..=1) of the waveform width.
    pub fn position_at(&self, fraction: f64) -> f64 {
        if fraction.is_nan() {
            return 0.0;
        }
        fraction.clamp(0.0, 1.0) * self.duration
    }

    /// Largest peak, floored so callers can normalise without dividing by zero.
    pub fn max_peak(&self) -> f32 {
        self.peaks.iter().copied().fold(0.01, f32::max)
    }
}

/// Splits the first channel into `num_points` equal blocks and returns the
/// maximum absolute sample of each block.
///
/// Trailing frames that do not fill a whole block are ignored, and a buffer
/// shorter than `num_points` frames yields all-zero peaks.
pub fn compute_peaks(audio: &AudioArc, num_points: usize) -> Vec<f32> {
    if num_points == 0 {
        return Vec::new();
    }

    let channels = audio.channels() as usize;
    let samples = audio.samples();
    let block_size = audio.frames() / num_points;

    (0..num_points)
        .map(|block| {
            let start = block * block_size;
            (start..start + block_size)
                .map(|frame| samples[frame * channels].abs())
                .fold(0.0f32, f32::max)
        })
        .collect()
}
