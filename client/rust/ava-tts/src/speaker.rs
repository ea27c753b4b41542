use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{Engine, SessionHints};
use crate::error::Result;
use crate::queue::PlaybackQueue;
use crate::timing::{self, SentenceTiming, WordTiming};

#[cfg(feature = "playback")]
use crate::audio::AudioOutput;

/// One call into [`Speaker::say`]. A whole utterance is `start`, then any
/// number of text pieces, then `end`; the flags may share a single request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SayRequest {
    pub text: String,
    pub start: bool,
    pub end: bool,
    pub emotion: Option<String>,
    pub context_texts: Vec<String>,
}

impl SayRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn start() -> Self {
        Self {
            start: true,
            ..Self::default()
        }
    }

    pub fn end() -> Self {
        Self {
            end: true,
            ..Self::default()
        }
    }

    /// Start, text and end in one go.
    pub fn utterance(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            start: true,
            end: true,
            ..Self::default()
        }
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_texts.push(context.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Progress {
    pub current_time: f64,
    pub total_time: f64,
    /// 0 to 100.
    pub percentage: f64,
    pub current_word: Option<WordTiming>,
    pub played_text: String,
}

/// An [`Engine`] feeding a [`PlaybackQueue`], optionally played on the
/// default output device.
pub struct Speaker<E: Engine> {
    engine: E,
    queue: Arc<PlaybackQueue>,
    #[cfg(feature = "playback")]
    output: Option<AudioOutput>,
}

impl<E: Engine> Speaker<E> {
    /// Plays through the default output device.
    #[cfg(feature = "playback")]
    pub fn new(engine: E) -> Result<Self> {
        let queue = Arc::new(PlaybackQueue::new());
        let output = AudioOutput::start(Arc::clone(&queue), engine.sample_rate())?;
        Ok(Self {
            engine,
            queue,
            output: Some(output),
        })
    }

    /// Buffers audio without opening a device; pull it from [`Speaker::queue`].
    pub fn headless(engine: E) -> Self {
        Self {
            engine,
            queue: Arc::new(PlaybackQueue::new()),
            #[cfg(feature = "playback")]
            output: None,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<PlaybackQueue> {
        &self.queue
    }

    pub async fn say(&self, req: SayRequest) -> Result<()> {
        if req.start {
            let hints = SessionHints {
                emotion: req.emotion.clone(),
                context_texts: req.context_texts.clone(),
            };
            let streamer = self.engine.start(hints).await?;
            self.queue.push(streamer);
            debug!(emotion = ?req.emotion, "utterance started");
        }
        if !req.text.is_empty() {
            self.engine.synthesize(&req.text).await?;
        }
        if req.end {
            if let Err(e) = self.engine.end().await {
                warn!(error = %e, "ending utterance failed");
            }
        }
        Ok(())
    }

    /// Cuts the current utterance off and ends its session.
    pub async fn stop(&self) {
        self.queue.stop_current();
        if let Err(e) = self.engine.end().await {
            warn!(error = %e, "ending session on stop failed");
        }
    }

    pub fn pause(&self) {
        #[cfg(feature = "playback")]
        {
            if let Some(output) = &self.output {
                output.pause();
            }
        }
    }

    pub fn resume(&self) {
        #[cfg(feature = "playback")]
        {
            if let Some(output) = &self.output {
                output.resume();
            }
        }
    }

    pub fn progress(&self) -> Progress {
        let Some(streamer) = self.queue.current_streamer() else {
            return Progress::default();
        };
        let (current_time, total_time) = streamer.progress();
        let percentage = if total_time > 0.0 {
            (current_time / total_time * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let timings = streamer.timings();
        Progress {
            current_time,
            total_time,
            percentage,
            current_word: timing::current_word(&timings, current_time).cloned(),
            played_text: timing::played_text(&timings, current_time),
        }
    }

    /// Timings of the utterance playing now.
    pub fn timings(&self) -> Vec<SentenceTiming> {
        self.queue
            .current_streamer()
            .map(|s| s.timings())
            .unwrap_or_default()
    }

    /// True once everything queued has played out.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn close(&self) -> Result<()> {
        self.queue.close();
        info!("speaker closed");
        self.engine.close()
    }
}
