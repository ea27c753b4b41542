//! Process-wide default speaker, built on first use.

use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;
use tracing::info;

use crate::config::Config;
use crate::engine::VolcEngine;
use crate::error::{Result, TtsError};
use crate::speaker::Speaker;

pub struct SpeakerRegistry {
    config: OnceLock<Config>,
    speaker: OnceCell<Arc<Speaker<VolcEngine>>>,
}

impl Default for SpeakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeakerRegistry {
    pub const fn new() -> Self {
        Self {
            config: OnceLock::new(),
            speaker: OnceCell::const_new(),
        }
    }

    /// The shared registry used by [`SpeakerRegistry::global`] callers.
    pub fn global() -> &'static SpeakerRegistry {
        static GLOBAL: SpeakerRegistry = SpeakerRegistry::new();
        &GLOBAL
    }

    /// Sets the configuration. Only the first call wins.
    pub fn configure(&self, config: Config) -> Result<()> {
        self.config
            .set(config)
            .map_err(|_| TtsError::Config("default speaker already configured".to_string()))
    }

    /// Returns the speaker, connecting on first call. Concurrent first
    /// callers share one connection attempt; a failed attempt is retried by
    /// the next caller.
    pub async fn speaker(&self) -> Result<Arc<Speaker<VolcEngine>>> {
        let speaker = self
            .speaker
            .get_or_try_init(|| async {
                let config = self.config.get().ok_or_else(|| {
                    TtsError::Config("default speaker used before configure".to_string())
                })?;
                let engine = VolcEngine::connect(config.engine.clone()).await?;
                let speaker = build_speaker(engine, config.playback.enabled)?;
                info!(playback = config.playback.enabled, "default speaker ready");
                Ok::<_, TtsError>(Arc::new(speaker))
            })
            .await?;
        Ok(Arc::clone(speaker))
    }

    /// The speaker if it has already been built.
    pub fn get(&self) -> Option<Arc<Speaker<VolcEngine>>> {
        self.speaker.get().cloned()
    }
}

#[cfg(feature = "playback")]
fn build_speaker(engine: VolcEngine, playback: bool) -> Result<Speaker<VolcEngine>> {
    if playback {
        Speaker::new(engine)
    } else {
        Ok(Speaker::headless(engine))
    }
}

#[cfg(not(feature = "playback"))]
fn build_speaker(engine: VolcEngine, playback: bool) -> Result<Speaker<VolcEngine>> {
    if playback {
        tracing::warn!("built without the playback feature, audio is only buffered");
    }
    Ok(Speaker::headless(engine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PlaybackConfig};

    fn unreachable_config() -> Config {
        let mut engine = EngineConfig::new("app", "access", "voice");
        engine.endpoint = "ws://127.0.0.1:1".to_string();
        Config {
            engine,
            playback: PlaybackConfig { enabled: false },
        }
    }

    #[tokio::test]
    async fn unconfigured_registry_errors() {
        let registry = SpeakerRegistry::new();
        assert!(matches!(registry.speaker().await, Err(TtsError::Config(_))));
        assert!(registry.get().is_none());
    }

    #[tokio::test]
    async fn configure_only_once() {
        let registry = SpeakerRegistry::new();
        registry.configure(unreachable_config()).expect("first configure");
        assert!(matches!(
            registry.configure(unreachable_config()),
            Err(TtsError::Config(_))
        ));
    }

    #[tokio::test]
    async fn failed_connect_is_not_cached() {
        let registry = SpeakerRegistry::new();
        registry.configure(unreachable_config()).expect("configure");

        assert!(registry.speaker().await.is_err());
        assert!(registry.get().is_none());
        // Second attempt dials again rather than replaying a cached error.
        assert!(matches!(registry.speaker().await, Err(TtsError::Ws(_))));
    }

    #[test]
    fn global_is_shared() {
        assert!(std::ptr::eq(SpeakerRegistry::global(), SpeakerRegistry::global()));
    }
}
