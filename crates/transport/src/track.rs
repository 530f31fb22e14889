use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::WaveformData;

/// Upper bound of the per-track gain slider, in percent.
pub const MAX_GAIN_PERCENT: f32 = 200.0;

/// Stable opaque key identifying a track for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl TrackId {
    /// A fresh 9-character base-36 id.
    pub fn generate() -> Self {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut rng = rand::thread_rng();
        let id = (0..9)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    LeadVocal,
    AdlibsBacks,
    Instrumental,
}

impl Category {
    /// Vocal tracks get the raw/processed source pair; instrumentals a single source.
    pub fn is_vocal(&self) -> bool {
        !matches!(self, Category::Instrumental)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::LeadVocal => "lead_vocal",
            Category::AdlibsBacks => "adlibs_backs",
            Category::Instrumental => "instrumental",
        }
    }
}

/// Which branch of a vocal track is audible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    Raw,
    #[serde(alias = "mixed")]
    Processed,
}

impl PlayMode {
    pub fn toggled(self) -> Self {
        match self {
            PlayMode::Raw => PlayMode::Processed,
            PlayMode::Processed => PlayMode::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayDivision {
    #[serde(rename = "1/4")]
    Quarter,
    #[serde(rename = "1/2")]
    Half,
    #[serde(rename = "1/8")]
    Eighth,
}

impl DelayDivision {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayDivision::Quarter => "1/4",
            DelayDivision::Half => "1/2",
            DelayDivision::Eighth => "1/8",
        }
    }
}

/// Parameters forwarded to the external mix service. Levels are 1..=3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixParams {
    pub delay: bool,
    pub delay_division: DelayDivision,
    pub delay_intensity: u8,
    pub reverb: bool,
    pub reverb_mode: u8,
    pub deesser: bool,
    pub deesser_mode: u8,
    pub tone_low: u8,
    pub tone_mid: u8,
    pub tone_high: u8,
    pub air: bool,
    pub bpm: f64,
    pub phone_fx: bool,
    pub doubler: bool,
    pub robot: bool,
}

impl Default for MixParams {
    fn default() -> Self {
        Self {
            delay: true,
            delay_division: DelayDivision::Quarter,
            delay_intensity: 2,
            reverb: true,
            reverb_mode: 2,
            deesser: true,
            deesser_mode: 2,
            tone_low: 2,
            tone_mid: 2,
            tone_high: 2,
            air: false,
            bpm: 120.0,
            phone_fx: false,
            doubler: false,
            robot: false,
        }
    }
}

/// Where a track's encoded audio can be read from.
///
/// `Object` references point into the in-process object registry and die with
/// the process; `Remote` references are URLs (absolute or relative to the API
/// base) and stay valid across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AudioRef {
    Object(String),
    Remote(String),
}

impl AudioRef {
    pub const OBJECT_SCHEME: &'static str = "blob:";

    pub fn as_str(&self) -> &str {
        match self {
            AudioRef::Object(s) | AudioRef::Remote(s) => s,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, AudioRef::Object(_))
    }

    /// Extracts the `id` query parameter of a service download URL, as used to
    /// reference an already mixed track when mastering.
    pub fn remote_id(&self) -> Option<&str> {
        let AudioRef::Remote(url) = self else {
            return None;
        };
        let (_, query) = url.split_once('?')?;
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("id="))
            .filter(|id| !id.is_empty())
    }
}

impl From<String> for AudioRef {
    fn from(value: String) -> Self {
        if value.starts_with(Self::OBJECT_SCHEME) {
            AudioRef::Object(value)
        } else {
            AudioRef::Remote(value)
        }
    }
}

impl From<&str> for AudioRef {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<AudioRef> for String {
    fn from(value: AudioRef) -> Self {
        match value {
            AudioRef::Object(s) | AudioRef::Remote(s) => s,
        }
    }
}

impl std::fmt::Display for AudioRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub category: Category,
    /// Percent, 0..=200.
    gain: f32,
    pub raw_ref: Option<AudioRef>,
    /// Set once an external mix job completes.
    pub processed_ref: Option<AudioRef>,
    /// Original file name, kept so the raw bytes can be recovered from the durable store.
    pub raw_file_name: Option<String>,
    pub play_mode: PlayMode,
    pub mix_params: MixParams,
    pub waveform: Option<WaveformData>,
    pub is_mixing: bool,
}

impl Track {
    pub fn new(id: TrackId, category: Category) -> Self {
        Self {
            id,
            category,
            gain: 100.0,
            raw_ref: None,
            processed_ref: None,
            raw_file_name: None,
            play_mode: PlayMode::Processed,
            mix_params: MixParams::default(),
            waveform: None,
            is_mixing: false,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, percent: f32) {
        self.gain = clamp_gain_percent(percent);
    }

    /// Linear factor applied by the track's master gain, at most 2x.
    pub fn gain_factor(&self) -> f32 {
        gain_factor(self.gain)
    }

    /// True when the track has something the scheduler could play, or something
    /// that can be recovered into a playable source.
    pub fn has_audio(&self) -> bool {
        self.raw_ref.is_some() || self.raw_file_name.is_some()
    }
}

pub fn clamp_gain_percent(percent: f32) -> f32 {
    if percent.is_nan() {
        return 100.0;
    }
    percent.clamp(0.0, MAX_GAIN_PERCENT)
}

pub fn gain_factor(percent: f32) -> f32 {
    (clamp_gain_percent(percent) / 100.0).clamp(0.0, 2.0)
}
