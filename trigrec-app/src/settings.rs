//! Persistent recorder settings (JSON file in the user config directory).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trigrec_core::disk::ChannelSpec;
use trigrec_core::TriggerSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    /// Root directory for continuous recordings.
    pub output_dir: PathBuf,
    /// File name template for triggered recordings; `{}` becomes the take
    /// number. `None` only reports gate events.
    pub output_template: Option<String>,
    pub period_frames: usize,
    pub buffer_periods: usize,
    pub channels: Vec<ChannelSpec>,
    pub attributes: BTreeMap<String, String>,
    pub trigger: TriggerSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            output_dir: PathBuf::from("recordings"),
            output_template: None,
            period_frames: 1024,
            buffer_periods: 64,
            channels: Vec::new(),
            attributes: BTreeMap::new(),
            trigger: TriggerSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.output_template = self
            .output_template
            .as_ref()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if self.output_dir.as_os_str().is_empty() {
            self.output_dir = PathBuf::from("recordings");
        }
        self.period_frames = self.period_frames.clamp(16, 16_384);
        self.buffer_periods = self.buffer_periods.clamp(4, 4096);

        let trigger = &mut self.trigger;
        trigger.prebuffer_ms = trigger.prebuffer_ms.clamp(0.0, 60_000.0);
        trigger.analysis_ms = trigger.analysis_ms.clamp(1.0, 10_000.0);
        trigger.open_threshold = trigger.open_threshold.abs().clamp(1e-4, 1.0);
        trigger.close_threshold = trigger.close_threshold.abs().clamp(1e-4, 1.0);
        trigger.open_rate = trigger.open_rate.max(0.0);
        trigger.close_rate = trigger.close_rate.max(0.0);
        trigger.open_periods = trigger.open_periods.clamp(1, 1000);
        trigger.close_periods = trigger.close_periods.clamp(1, 1000);
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trigrec")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("trigrec")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
