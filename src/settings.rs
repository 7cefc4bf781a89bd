use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CaptureConstraints, OutputConfig};

const SETTINGS_DIR_NAME: &str = "voice-preview";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variable that overrides `backend_host`
pub const HOST_ENV_VAR: &str = "VOICE_PREVIEW_HOST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSettings {
    /// Base URL of the voice-agent backend (http or https).
    pub backend_host: String,

    /// Fixed wire sample rate in Hz. Both directions use it.
    pub sample_rate: u32,

    /// Samples per capture block; one block becomes one outbound frame.
    pub block_size: usize,

    /// Static amplification applied to agent audio before the device.
    pub output_gain: f32,

    /// Hard limit on a session's lifetime, counted from start.
    pub session_timeout_ms: u64,

    /// Capture hints. Best effort; the device may not honor them.
    pub echo_cancellation: bool,
    pub noise_suppression: bool,

    pub token_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Outbound frames buffered ahead of the socket. A full queue drops frames.
    pub outbound_queue_frames: usize,

    /// Inbound channel events buffered ahead of the playback pump.
    pub inbound_queue_frames: usize,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            backend_host: "http://127.0.0.1:8000".to_string(),
            sample_rate: 24000,
            block_size: 4096,
            output_gain: 2.0,
            session_timeout_ms: 10 * 60 * 1000,
            echo_cancellation: true,
            noise_suppression: true,
            token_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            outbound_queue_frames: 32,
            inbound_queue_frames: 256,
        }
    }
}

impl PreviewSettings {
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: self.sample_rate,
            channels: 1,
            block_size: self.block_size,
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
        }
    }

    pub fn output_config(&self) -> OutputConfig {
        OutputConfig {
            sample_rate: self.sample_rate,
            gain: self.output_gain,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Apply `VOICE_PREVIEW_HOST` from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(HOST_ENV_VAR).filter(|h| !h.trim().is_empty()) {
            log::info!("Settings: backend host overridden by {}", HOST_ENV_VAR);
            self.backend_host = host.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.backend_host.starts_with("http://") || self.backend_host.starts_with("https://"))
        {
            return Err(format!(
                "backend_host must be an http(s) URL, got {:?}",
                self.backend_host
            ));
        }
        if self.sample_rate == 0 {
            return Err("sample_rate must be greater than zero".to_string());
        }
        if self.block_size == 0 {
            return Err("block_size must be greater than zero".to_string());
        }
        if !self.output_gain.is_finite() || self.output_gain <= 0.0 {
            return Err(format!(
                "output_gain must be a positive number, got {}",
                self.output_gain
            ));
        }
        if self.session_timeout_ms == 0 {
            return Err("session_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// `<config dir>/voice-preview/settings.json`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Read settings from `path`. Missing or unreadable files yield defaults.
pub fn load_settings(path: &Path) -> PreviewSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<PreviewSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                PreviewSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => PreviewSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            PreviewSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &PreviewSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
