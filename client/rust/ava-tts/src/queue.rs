use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::streamer::Streamer;

/// Plays streamers back to back. A streamer is only replaced once it reports
/// finished, so a superseded session drains before the next one starts.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    current: Option<Arc<Streamer>>,
    waiting: VecDeque<Arc<Streamer>>,
    closed: bool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, streamer: Arc<Streamer>) {
        let mut st = self.lock();
        if st.closed {
            streamer.cancel();
            return;
        }
        st.waiting.push_back(streamer);
    }

    /// Pulls from the current streamer, moving on to the next one whenever
    /// the current finishes. Returns `(0, true)` when nothing is queued and
    /// `(0, false)` only after [`PlaybackQueue::close`].
    pub fn stream(&self, out: &mut [[f32; 2]]) -> (usize, bool) {
        let mut st = self.lock();
        loop {
            if st.closed {
                return (0, false);
            }
            let current = match &st.current {
                Some(current) => Arc::clone(current),
                None => match st.waiting.pop_front() {
                    Some(next) => {
                        st.current = Some(Arc::clone(&next));
                        next
                    }
                    None => return (0, true),
                },
            };
            let (n, more) = current.stream(out);
            if more {
                return (n, true);
            }
            st.current = None;
        }
    }

    pub fn current_streamer(&self) -> Option<Arc<Streamer>> {
        self.lock().current.clone()
    }

    pub fn stop_current(&self) {
        if let Some(current) = &self.lock().current {
            current.cancel();
        }
    }

    pub fn clear(&self) {
        let mut st = self.lock();
        if let Some(current) = st.current.take() {
            current.cancel();
        }
        for streamer in st.waiting.drain(..) {
            streamer.cancel();
        }
    }

    pub fn close(&self) {
        self.clear();
        self.lock().closed = true;
    }

    /// Streamers not yet finished, including the one playing.
    pub fn len(&self) -> usize {
        let st = self.lock();
        st.waiting.len() + usize::from(st.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
