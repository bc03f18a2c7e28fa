//! Extraction progress reporting.

use std::time::{Duration, Instant};

/// Receives coarse extraction progress as a percentage string (`"42%"`).
///
/// Listeners are passed per call; the reader keeps no global listener.
pub trait ProgressListener: Send + Sync {
    fn on_progress_update(&self, progress: &str);
}

impl<F> ProgressListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_progress_update(&self, progress: &str) {
        self(progress)
    }
}

/// Turns byte counts into throttled, monotonic percentage updates.
pub(crate) struct ProgressTracker<'a> {
    listener: Option<&'a dyn ProgressListener>,
    total: u64,
    done: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(listener: Option<&'a dyn ProgressListener>, total: u64, interval: Duration) -> Self {
        Self {
            listener,
            total,
            done: 0,
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    pub(crate) fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        // Capped below 100 so only finish() reports completion
        ((self.done.min(self.total) * 100 / self.total) as u8).min(99)
    }

    pub(crate) fn advance(&mut self, amount: u64) {
        self.done = self.done.saturating_add(amount);
        let Some(listener) = self.listener else {
            return;
        };

        let percent = self.percent();
        if self.last_percent.is_some_and(|last| percent <= last) {
            return;
        }
        let due = self
            .last_emit
            .map_or(true, |at| at.elapsed() >= self.interval);
        if !due {
            return;
        }

        listener.on_progress_update(&format!("{}%", percent));
        self.last_emit = Some(Instant::now());
        self.last_percent = Some(percent);
    }

    pub(crate) fn finish(&mut self) {
        if let Some(listener) = self.listener {
            listener.on_progress_update("100%");
            self.last_percent = Some(100);
        }
    }
}
