//! Rolling frame-rate tracker over a fixed window of frame intervals

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

pub struct FramerateTracker {
    /// Intervals between consecutive frames, oldest evicted first
    intervals: HeapRb<u64>,
    last_ns: Option<u64>,
    frames: u64,
}

impl FramerateTracker {
    pub fn new(window: usize) -> Self {
        Self {
            intervals: HeapRb::new(window.max(1)),
            last_ns: None,
            frames: 0,
        }
    }

    pub fn record(&mut self, timestamp_ns: u64) {
        if let Some(last) = self.last_ns {
            self.intervals
                .push_overwrite(timestamp_ns.saturating_sub(last));
        }
        self.last_ns = Some(timestamp_ns);
        self.frames += 1;
    }

    pub fn mean_interval_ns(&self) -> Option<f64> {
        let count = self.intervals.occupied_len();
        if count == 0 {
            return None;
        }
        let total: u64 = self.intervals.iter().sum();
        Some(total as f64 / count as f64)
    }

    /// Frames per second over the window
    pub fn framerate(&self) -> Option<f64> {
        self.mean_interval_ns()
            .filter(|mean| *mean > 0.0)
            .map(|mean| 1e9 / mean)
    }

    /// Frames recorded since creation or the last reset
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn reset(&mut self) {
        self.intervals.clear();
        self.last_ns = None;
        self.frames = 0;
    }
}
