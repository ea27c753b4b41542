//! Per-session PCM buffer sitting between the network reader and the audio
//! output.
//!
//! The engine appends little-endian 16-bit PCM as it arrives; the output pulls
//! whole frames as stereo `f32`. Progress is derived from the number of bytes
//! handed to the output, so it tracks what was actually played rather than
//! what was received.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::{Buf, BytesMut};

use crate::timing::{self, SentenceTiming};

const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug)]
pub struct Streamer {
    sample_rate: u32,
    channels: u16,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    buf: BytesMut,
    closed: bool,
    cancelled: bool,
    finished: bool,
    bytes_played: u64,
    started_at: Option<Instant>,
    total_duration: f64,
    timings: Vec<SentenceTiming>,
}

impl Streamer {
    /// `channels` is clamped to 1 or 2; anything wider is treated as stereo.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.clamp(1, 2),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    fn bytes_per_second(&self) -> f64 {
        self.sample_rate as f64 * self.frame_bytes() as f64
    }

    pub fn append_audio(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut st = self.lock();
        if st.closed || st.cancelled {
            return;
        }
        st.buf.extend_from_slice(data);
    }

    /// Fills `out` with as many whole frames as are buffered.
    ///
    /// Returns `(0, true)` while open and starved. Once closed and drained, or
    /// cancelled, returns `(0, false)` on this and every later call.
    pub fn stream(&self, out: &mut [[f32; 2]]) -> (usize, bool) {
        let mut st = self.lock();
        if st.finished {
            return (0, false);
        }
        if st.cancelled {
            st.buf.clear();
            st.finished = true;
            return (0, false);
        }
        if out.is_empty() {
            return (0, true);
        }

        let frame_bytes = self.frame_bytes();
        let frames = out.len().min(st.buf.len() / frame_bytes);
        if frames == 0 {
            if !st.closed {
                return (0, true);
            }
            if st.buf.is_empty() {
                st.finished = true;
                return (0, false);
            }
            // A trailing partial frame; missing samples play as silence.
            let tail = st.buf.split();
            self.mark_played(&mut st, tail.len());
            out[0] = self.decode_frame(&tail);
            return (1, true);
        }

        let chunk = st.buf.split_to(frames * frame_bytes);
        self.mark_played(&mut st, chunk.len());
        for (slot, frame) in out.iter_mut().zip(chunk.chunks(frame_bytes)) {
            *slot = self.decode_frame(frame);
        }
        (frames, true)
    }

    fn mark_played(&self, st: &mut State, bytes: usize) {
        if st.started_at.is_none() {
            st.started_at = Some(Instant::now());
        }
        st.bytes_played += bytes as u64;
    }

    fn decode_frame(&self, frame: &[u8]) -> [f32; 2] {
        let left = pcm16_to_f32(frame.get(..BYTES_PER_SAMPLE).unwrap_or(frame));
        if self.channels == 1 {
            return [left, left];
        }
        let right = pcm16_to_f32(frame.get(BYTES_PER_SAMPLE..).unwrap_or(&[]));
        [left, right]
    }

    /// Marks end of input. Buffered audio still plays out.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Stops immediately and discards whatever was not played yet.
    pub fn cancel(&self) {
        let mut st = self.lock();
        st.cancelled = true;
        st.buf.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn buffered_bytes(&self) -> usize {
        self.lock().buf.len()
    }

    /// `(current, total)` in seconds. Current is zero until the first pull and
    /// never exceeds a known total.
    pub fn progress(&self) -> (f64, f64) {
        let st = self.lock();
        if st.started_at.is_none() {
            return (0.0, st.total_duration);
        }
        let mut current = st.bytes_played as f64 / self.bytes_per_second();
        if st.total_duration > 0.0 && current > st.total_duration {
            current = st.total_duration;
        }
        (current, st.total_duration)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.lock().started_at
    }

    pub fn set_total_duration(&self, seconds: f64) {
        self.lock().total_duration = seconds;
    }

    pub fn set_timings(&self, timings: &[SentenceTiming]) {
        self.lock().timings = timings.to_vec();
    }

    pub fn add_timing(&self, timing: SentenceTiming) {
        self.lock().timings.push(timing);
    }

    pub fn timings(&self) -> Vec<SentenceTiming> {
        self.lock().timings.clone()
    }

    pub fn played_text(&self, t: f64) -> String {
        timing::played_text(&self.lock().timings, t)
    }

    /// Forgets everything played or buffered so far.
    pub fn reset_progress(&self) {
        let mut st = self.lock();
        st.bytes_played = 0;
        st.started_at = None;
        st.total_duration = 0.0;
        st.timings.clear();
        st.buf.clear();
    }
}

/// Little-endian signed 16-bit sample scaled into [-1, 1). Short input is silence.
pub fn pcm16_to_f32(sample: &[u8]) -> f32 {
    if sample.len() < BYTES_PER_SAMPLE {
        return 0.0;
    }
    let mut sample = sample;
    sample.get_i16_le() as f32 / 32768.0
}
