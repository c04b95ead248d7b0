//! Bounded latency tracking for diagnostics.

use crate::types::EventId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default number of samples kept.
pub const DEFAULT_SAMPLE_WINDOW: usize = 1000;

/// Latency summary in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyMeasurements {
    pub count: usize,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Ring buffer of operation latencies keyed by event id.
///
/// Operations that never end (lost acks, removed clients) are evicted once
/// more than `window` are pending, so memory stays bounded.
#[derive(Debug)]
pub struct RequestStatistics {
    window: usize,
    samples: Vec<Duration>,
    next: usize,
    pending: HashMap<EventId, Instant>,
}

impl RequestStatistics {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: Vec::with_capacity(window),
            next: 0,
            pending: HashMap::new(),
        }
    }

    pub fn start_operation(&mut self, id: EventId, at: Instant) {
        if self.pending.len() >= self.window {
            if let Some(oldest) = self.pending.iter().min_by_key(|(_, t)| **t).map(|(id, _)| *id) {
                self.pending.remove(&oldest);
            }
        }
        self.pending.insert(id, at);
    }

    /// Record the end of an operation, returning its latency.
    pub fn end_operation(&mut self, id: EventId, at: Instant) -> Option<Duration> {
        let started = self.pending.remove(&id)?;
        let latency = at.saturating_duration_since(started);
        if self.samples.len() < self.window {
            self.samples.push(latency);
        } else {
            self.samples[self.next] = latency;
        }
        self.next = (self.next + 1) % self.window;
        Some(latency)
    }

    /// Forget an operation without recording it.
    pub fn cancel_operation(&mut self, id: EventId) {
        self.pending.remove(&id);
    }

    pub fn measurements(&self) -> LatencyMeasurements {
        if self.samples.is_empty() {
            return LatencyMeasurements::default();
        }
        let mut sorted: Vec<u64> = self.samples.iter().map(|d| d.as_micros() as u64).collect();
        sorted.sort_unstable();

        let percentile = |p: usize| {
            let rank = (sorted.len() * p).div_ceil(100);
            sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
        };
        let total: u64 = sorted.iter().sum();

        LatencyMeasurements {
            count: sorted.len(),
            mean_us: total / sorted.len() as u64,
            p50_us: percentile(50),
            p90_us: percentile(90),
            p99_us: percentile(99),
            max_us: sorted[sorted.len() - 1],
        }
    }
}

impl Default for RequestStatistics {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}
