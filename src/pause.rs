//! Pause request shared by the producer loop and the command dispatcher.
//!
//! Flag and duration live behind one lock, so each side reads or writes them
//! as a pair. That does not make a pause exactly-once: a request that lands
//! while the loop is already sleeping on a previous one is wiped by the clear
//! that follows, and a request that lands after the per-cycle check waits for
//! the next cycle.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PauseRequest {
    pub should_pause: bool,
    pub duration_ms: i64,
}

impl PauseRequest {
    /// Negative durations pause for zero time.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms.max(0) as u64)
    }
}

#[derive(Debug, Default)]
pub struct PauseState {
    inner: Mutex<PauseRequest>,
}

impl PauseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any outstanding request.
    pub fn request(&self, duration_ms: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.should_pause = true;
        inner.duration_ms = duration_ms;
    }

    pub fn snapshot(&self) -> PauseRequest {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How long to pause, if a pause is outstanding.
    pub fn pending(&self) -> Option<Duration> {
        let request = self.snapshot();
        request.should_pause.then(|| request.duration())
    }

    /// Drops the flag. The last duration is left in place.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_pause = false;
    }
}
