//! Windowed sample store for histogram and timer metrics.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Distribution summary over the samples currently in the window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Nearest-rank percentile over already sorted values. `p` is in `0..=100`.
pub fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted_values.len() as f64).ceil() as usize;
    sorted_values[rank.clamp(1, sorted_values.len()) - 1]
}

/// Timestamped samples bounded by age and count.
#[derive(Debug)]
pub struct Histogram {
    samples: VecDeque<(Instant, f64)>,
    retention: Duration,
    max_samples: usize,
}

impl Histogram {
    pub fn new(retention: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
            max_samples: max_samples.max(1),
        }
    }

    pub fn record_at(&mut self, at: Instant, value: f64) {
        self.samples.push_back((at, value));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        self.prune(at);
    }

    /// Drop samples older than the retention window.
    pub fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.retention {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> HistogramSummary {
        if self.samples.is_empty() {
            return HistogramSummary::default();
        }
        let mut values: Vec<f64> = self.samples.iter().map(|(_, v)| *v).collect();
        values.sort_by(f64::total_cmp);
        let count = values.len();
        HistogramSummary {
            count,
            min: values[0],
            max: values[count - 1],
            mean: values.iter().sum::<f64>() / count as f64,
            p50: percentile(&values, 50.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
        }
    }
}
