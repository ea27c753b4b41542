use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Result, TtsError};

pub const DEFAULT_ENDPOINT: &str = "wss://openspeech.bytedance.com/api/v3/tts/bidirection";
pub const ACCESS_KEY_ENV: &str = "VOLC_ACCESS_KEY";
pub const APP_KEY_ENV: &str = "VOLC_APP_KEY";

const MIN_FINISH_TIMEOUT_MS: u64 = 5_000;
const MAX_FINISH_TIMEOUT_MS: u64 = 30_000;

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_resource_id() -> String {
    "seed-tts-2.0".to_string()
}

fn default_encoding() -> String {
    "pcm".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u16 {
    1
}

fn default_speed_ratio() -> f32 {
    1.0
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_session_start_timeout_ms() -> u64 {
    5_000
}

fn default_session_finish_timeout_ms() -> u64 {
    10_000
}

fn default_playback_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_speed_ratio")]
    pub speed_ratio: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            speed_ratio: default_speed_ratio(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_session_start_timeout_ms")]
    pub session_start_ms: u64,
    /// Clamped into 5-30 s.
    #[serde(default = "default_session_finish_timeout_ms")]
    pub session_finish_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout_ms(),
            session_start_ms: default_session_start_timeout_ms(),
            session_finish_ms: default_session_finish_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn session_start(&self) -> Duration {
        Duration::from_millis(self.session_start_ms)
    }

    pub fn session_finish(&self) -> Duration {
        Duration::from_millis(
            self.session_finish_ms
                .clamp(MIN_FINISH_TIMEOUT_MS, MAX_FINISH_TIMEOUT_MS),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default = "default_resource_id")]
    pub resource_id: String,
    pub voice_type: String,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl EngineConfig {
    pub fn new(
        app_key: impl Into<String>,
        access_key: impl Into<String>,
        voice_type: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: default_endpoint(),
            app_key: app_key.into(),
            access_key: access_key.into(),
            resource_id: default_resource_id(),
            voice_type: voice_type.into(),
            audio: AudioConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_key.trim().is_empty() {
            return Err(TtsError::Config(format!(
                "app_key is empty (set it in the config file or {APP_KEY_ENV})"
            )));
        }
        if self.access_key.trim().is_empty() {
            return Err(TtsError::Config(format!(
                "access_key is empty (set it in the config file or {ACCESS_KEY_ENV})"
            )));
        }
        if self.voice_type.trim().is_empty() {
            return Err(TtsError::Config("voice_type is empty".to_string()));
        }
        if self.resource_id.trim().is_empty() {
            return Err(TtsError::Config("resource_id is empty".to_string()));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|e| TtsError::Config(format!("invalid endpoint {}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TtsError::Config(format!(
                "endpoint must be ws:// or wss://, got {}",
                self.endpoint
            )));
        }
        if self.audio.encoding != "pcm" {
            return Err(TtsError::Config(format!(
                "unsupported audio encoding {:?}, only pcm is played",
                self.audio.encoding
            )));
        }
        if self.audio.sample_rate == 0 {
            return Err(TtsError::Config("sample_rate must be positive".to_string()));
        }
        if !matches!(self.audio.channels, 1 | 2) {
            return Err(TtsError::Config(format!(
                "channels must be 1 or 2, got {}",
                self.audio.channels
            )));
        }
        Ok(())
    }

    /// Fills empty credentials from `lookup` (usually the process environment).
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.access_key.is_empty() {
            if let Some(key) = lookup(ACCESS_KEY_ENV) {
                debug!("access key taken from {ACCESS_KEY_ENV}");
                self.access_key = key;
            }
        }
        if self.app_key.is_empty() {
            if let Some(key) = lookup(APP_KEY_ENV) {
                debug!("app key taken from {APP_KEY_ENV}");
                self.app_key = key;
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Open the default output device. When off, audio is only buffered.
    #[serde(default = "default_playback_enabled")]
    pub enabled: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: default_playback_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Reads a TOML file, fills credentials from the environment and validates.
    pub fn load<P: AsRef<Path>>(p: P) -> Result<Self> {
        let config = std::fs::read_to_string(p)?;
        let mut config = Self::from_toml_str(&config)?;
        config.engine.apply_env_with(|k| std::env::var(k).ok());
        config.engine.validate()?;
        Ok(config)
    }
}
