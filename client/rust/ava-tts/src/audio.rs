//! Speaker output. The device callback pulls stereo frames from a
//! [`PlaybackQueue`], resampling linearly when the device cannot run at the
//! synthesis rate.

use crate::queue::PlaybackQueue;

/// Linear-interpolating frame resampler fed from a [`PlaybackQueue`].
#[derive(Debug)]
pub struct FrameResampler {
    step: f64,
    pos: f64,
    buf: Vec<[f32; 2]>,
    scratch: Vec<[f32; 2]>,
}

impl FrameResampler {
    pub fn new(in_rate_hz: u32, out_rate_hz: u32) -> Self {
        Self {
            step: in_rate_hz as f64 / out_rate_hz.max(1) as f64,
            pos: 0.0,
            buf: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Writes up to `out.len()` resampled frames, returning how many were
    /// written. Short output means the queue ran dry.
    pub fn fill(&mut self, queue: &PlaybackQueue, out: &mut [[f32; 2]]) -> usize {
        let needed = (out.len() as f64 * self.step).ceil() as usize + 2;
        if self.buf.len() < needed {
            self.scratch.resize(needed - self.buf.len(), [0.0; 2]);
            let (n, _) = queue.stream(&mut self.scratch);
            self.buf.extend_from_slice(&self.scratch[..n]);
        }

        let mut written = 0;
        while written < out.len() {
            let idx = self.pos as usize;
            if idx + 1 >= self.buf.len() {
                break;
            }
            let frac = (self.pos - idx as f64) as f32;
            let (a, b) = (self.buf[idx], self.buf[idx + 1]);
            out[written] = [a[0] + (b[0] - a[0]) * frac, a[1] + (b[1] - a[1]) * frac];
            written += 1;
            self.pos += self.step;
        }

        let consumed = (self.pos as usize).min(self.buf.len());
        self.buf.drain(..consumed);
        self.pos -= consumed as f64;
        written
    }
}

#[cfg(feature = "playback")]
pub use output::AudioOutput;

#[cfg(feature = "playback")]
mod output {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tracing::{info, warn};

    use super::FrameResampler;
    use crate::error::{Result, TtsError};
    use crate::queue::PlaybackQueue;

    fn audio_err(e: impl std::fmt::Display) -> TtsError {
        TtsError::Audio(e.to_string())
    }

    /// Default output device playing a [`PlaybackQueue`].
    ///
    /// `cpal::Stream` is not `Send`, so the stream lives on its own thread for
    /// as long as this handle does.
    pub struct AudioOutput {
        paused: Arc<AtomicBool>,
        device_rate: u32,
        shutdown: Option<mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl AudioOutput {
        pub fn start(queue: Arc<PlaybackQueue>, source_rate: u32) -> Result<Self> {
            let paused = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = mpsc::channel::<Result<u32>>();
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

            let callback_paused = Arc::clone(&paused);
            let thread = std::thread::Builder::new()
                .name("ava-audio-out".to_string())
                .spawn(move || match open_stream(queue, source_rate, callback_paused) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })?;

            let device_rate = match ready_rx.recv() {
                Ok(Ok(rate)) => rate,
                Ok(Err(e)) => {
                    let _ = thread.join();
                    return Err(e);
                }
                Err(_) => {
                    return Err(TtsError::Audio(
                        "audio thread exited during setup".to_string(),
                    ));
                }
            };

            Ok(Self {
                paused,
                device_rate,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            })
        }

        pub fn pause(&self) {
            self.paused.store(true, Ordering::Release);
        }

        pub fn resume(&self) {
            self.paused.store(false, Ordering::Release);
        }

        pub fn is_paused(&self) -> bool {
            self.paused.load(Ordering::Acquire)
        }

        pub fn device_rate(&self) -> u32 {
            self.device_rate
        }
    }

    impl Drop for AudioOutput {
        fn drop(&mut self) {
            drop(self.shutdown.take());
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn open_stream(
        queue: Arc<PlaybackQueue>,
        source_rate: u32,
        paused: Arc<AtomicBool>,
    ) -> Result<(cpal::Stream, u32)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| TtsError::Audio("no output device available".to_string()))?;

        let covers_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate().0 <= source_rate
                && source_rate <= c.max_sample_rate().0
        };
        let mut configs = device.supported_output_configs().map_err(audio_err)?;
        let config_range = match configs.find(|c| c.channels() == 2 && covers_rate(c)) {
            Some(range) => range,
            None => device
                .supported_output_configs()
                .map_err(audio_err)?
                .find(|c| c.sample_format() == cpal::SampleFormat::F32)
                .ok_or_else(|| TtsError::Audio("no f32 output config".to_string()))?,
        };

        let sample_rate = cpal::SampleRate(source_rate)
            .clamp(config_range.min_sample_rate(), config_range.max_sample_rate());
        let config: cpal::StreamConfig = config_range.with_sample_rate(sample_rate).into();
        let channels = config.channels as usize;
        let device_rate = config.sample_rate.0;

        let device_name = device.name().unwrap_or_else(|_| "unk".to_string());
        info!(
            device = %device_name,
            device_rate,
            channels,
            source_rate,
            "audio output opened"
        );

        let mut resampler = (device_rate != source_rate)
            .then(|| FrameResampler::new(source_rate, device_rate));
        let mut frames: Vec<[f32; 2]> = Vec::new();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    data.fill(0.0);
                    if paused.load(Ordering::Acquire) || channels == 0 {
                        return;
                    }
                    frames.resize(data.len() / channels, [0.0; 2]);
                    let n = match resampler.as_mut() {
                        Some(r) => r.fill(&queue, &mut frames),
                        None => queue.stream(&mut frames).0,
                    };
                    for (frame, out) in frames[..n].iter().zip(data.chunks_mut(channels)) {
                        match out {
                            [mono] => *mono = (frame[0] + frame[1]) * 0.5,
                            [left, right, ..] => {
                                *left = frame[0];
                                *right = frame[1];
                            }
                            [] => {}
                        }
                    }
                },
                move |err| warn!(error = %err, "audio output stream error"),
                None,
            )
            .map_err(audio_err)?;
        stream.play().map_err(audio_err)?;

        Ok((stream, device_rate))
    }
}
