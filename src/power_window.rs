use chrono::{DateTime, Duration, FixedOffset};
use std::collections::VecDeque;

/// How far back samples are kept, relative to the newest one
pub const WINDOW_MINUTES: i64 = 5;

/// Trailing time window of power samples (kW), ordered by arrival.
#[derive(Debug, Clone, Default)]
pub struct PowerWindow {
    samples: VecDeque<(DateTime<FixedOffset>, f64)>,
}

impl PowerWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops samples older than the window relative to `timestamp`, then appends the sample.
    /// Returns the average after adding it.
    pub fn add(&mut self, timestamp: DateTime<FixedOffset>, power_kw: f64) -> f64 {
        let cutoff = timestamp - Duration::minutes(WINDOW_MINUTES);
        while self.samples.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.samples.pop_front();
        }
        self.samples.push_back((timestamp, power_kw));
        self.average().unwrap_or(power_kw)
    }

    /// Mean power over the retained samples, `None` when empty
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|(_, p)| p).sum();
        Some(sum / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
