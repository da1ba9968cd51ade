//! Bounded time series of detection samples for charting.

use serde::{Deserialize, Serialize};

use crate::ringbuffer::Ringbuffer;

/// Default number of samples kept.
pub const DEFAULT_CAPACITY: usize = 100;

/// One point of the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Wall-clock label, `HH:MM:SS`.
    pub timestamp: String,
    pub bees: u64,
    pub varroa: u64,
    pub infestation_ratio: f64,
}

/// Index-aligned copy of the series as plain sequences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSnapshot {
    pub timestamps: Vec<String>,
    pub bee_counts: Vec<u64>,
    pub varroa_counts: Vec<u64>,
    pub infestation_ratio: Vec<f64>,
}

impl TimeSeriesSnapshot {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// FIFO of samples capped at a fixed capacity.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    samples: Ringbuffer<Sample>,
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TimeSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Ringbuffer::new(capacity),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Unzips the samples into parallel sequences, oldest first.
    pub fn snapshot(&self) -> TimeSeriesSnapshot {
        let history = self.samples.get_history();
        let mut snap = TimeSeriesSnapshot {
            timestamps: Vec::with_capacity(history.len()),
            bee_counts: Vec::with_capacity(history.len()),
            varroa_counts: Vec::with_capacity(history.len()),
            infestation_ratio: Vec::with_capacity(history.len()),
        };
        for s in history {
            snap.timestamps.push(s.timestamp);
            snap.bee_counts.push(s.bees);
            snap.varroa_counts.push(s.varroa);
            snap.infestation_ratio.push(s.infestation_ratio);
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: u64) -> Sample {
        Sample {
            timestamp: format!("12:00:{:02}", i),
            bees: i,
            varroa: i / 2,
            infestation_ratio: i as f64 / 100.0,
        }
    }

    #[test]
    fn test_snapshot_is_index_aligned() {
        let mut ts = TimeSeries::new(10);
        ts.push(sample(1));
        ts.push(sample(4));

        let snap = ts.snapshot();
        assert_eq!(snap.timestamps, vec!["12:00:01", "12:00:04"]);
        assert_eq!(snap.bee_counts, vec![1, 4]);
        assert_eq!(snap.varroa_counts, vec![0, 2]);
        assert_eq!(snap.infestation_ratio, vec![0.01, 0.04]);
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let mut ts = TimeSeries::new(5);
        for i in 0..12 {
            ts.push(sample(i));
        }

        let snap = ts.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap.bee_counts, vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(TimeSeries::default().capacity(), DEFAULT_CAPACITY);
    }
}
