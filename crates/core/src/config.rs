use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::route::Platform;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutePreference {
    /// Media-element routing on mobile, direct output elsewhere.
    #[default]
    Auto,
    Direct,
    MediaElement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    /// Schedule lead on mobile, where output hardware needs time to wake up.
    pub mobile_lead_ms: u64,
    pub desktop_lead_ms: u64,
    pub seek_debounce_ms: u64,
    /// Seeks closer than this to the previous one inside the debounce window
    /// are dropped.
    pub seek_tolerance_secs: f64,
    pub toggle_debounce_ms: u64,
    pub snapshot_debounce_ms: u64,
    pub waveform_points: usize,
    pub mix_poll_interval_ms: u64,
    pub api_base: String,
    /// Durable byte store location; the platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    pub route: RoutePreference,
    /// Device signature reported by an embedding shell. When set it decides
    /// the platform instead of the build target.
    pub user_agent: Option<String>,
    pub max_touch_points: u32,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            mobile_lead_ms: 150,
            desktop_lead_ms: 20,
            seek_debounce_ms: 120,
            seek_tolerance_secs: 0.05,
            toggle_debounce_ms: 120,
            snapshot_debounce_ms: 300,
            waveform_points: vox_transport::WAVEFORM_POINTS,
            mix_poll_interval_ms: 500,
            api_base: "http://127.0.0.1:8000".to_string(),
            data_dir: None,
            route: RoutePreference::Auto,
            user_agent: None,
            max_touch_points: 0,
        }
    }
}

impl StudioConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vox").join("config.toml"))
    }

    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Missing or unreadable files fall back to the defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("ignoring invalid config {}: {err}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        if let Err(err) = self.save_to(&path) {
            log::warn!("could not save config to {}: {err}", path.display());
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        fs::write(path, contents)
    }

    pub fn platform(&self) -> Platform {
        match &self.user_agent {
            Some(ua) => Platform::classify(ua, self.max_touch_points),
            None => Platform::native(),
        }
    }

    pub fn lead_time(&self, platform: Platform) -> Duration {
        match platform {
            Platform::Mobile => Duration::from_millis(self.mobile_lead_ms),
            Platform::Desktop => Duration::from_millis(self.desktop_lead_ms),
        }
    }

    pub fn seek_debounce(&self) -> Duration {
        Duration::from_millis(self.seek_debounce_ms)
    }

    pub fn toggle_debounce(&self) -> Duration {
        Duration::from_millis(self.toggle_debounce_ms)
    }

    pub fn snapshot_debounce(&self) -> Duration {
        Duration::from_millis(self.snapshot_debounce_ms)
    }

    pub fn mix_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mix_poll_interval_ms)
    }

    pub fn durable_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("vox")
                .join("takes")
        })
    }
}
