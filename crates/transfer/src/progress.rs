use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Which side of a session a progress report comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// A progress report, delivered best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: Direction,
    /// Whole percent, 0..=100.
    pub percent: u8,
    pub bytes: u64,
    pub total_bytes: u64,
}

/// `round(done / total * 100)`, with halves rounded up.
///
/// An empty transfer (`total == 0`) is complete by definition.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total) as u128;
    let total = total as u128;
    ((done * 100 + total / 2) / total) as u8
}

/// Suppresses progress values that do not cross a new `step` boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressThrottle {
    step: u8,
    last_bucket: u8,
    reported: u8,
}

impl ProgressThrottle {
    /// A `step` of 0 is treated as 1.
    pub fn new(step: u8) -> Self {
        Self {
            step: step.max(1),
            last_bucket: 0,
            reported: 0,
        }
    }

    /// Returns `Some(percent)` if it is the first value past a new boundary.
    pub fn observe(&mut self, percent: u8) -> Option<u8> {
        let bucket = percent.min(100) / self.step;
        if bucket > self.last_bucket {
            self.last_bucket = bucket;
            self.reported = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Returns `Some(100)` unless 100% was already reported.
    pub fn finish(&mut self) -> Option<u8> {
        if self.reported >= 100 {
            return None;
        }
        self.last_bucket = 100 / self.step;
        self.reported = 100;
        Some(100)
    }
}

/// Sends a report without waiting; a full or closed channel drops it.
pub(crate) fn report(tx: Option<&mpsc::Sender<TransferProgress>>, progress: TransferProgress) {
    if let Some(tx) = tx {
        let _ = tx.try_send(progress);
    }
}

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.max(2),
            window,
        }
    }

    /// Records `bytes` transferred since the previous sample.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&mut self, bytes: u64, timestamp: Instant) {
        self.samples.push_back(SpeedSample { bytes, timestamp });

        if let Some(cutoff) = timestamp.checked_sub(self.window) {
            while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average bytes/second across the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample's bytes were moved before the window opened.
        let bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining_bytes` at the current speed.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}
