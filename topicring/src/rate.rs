//! Publish rate derived from two observations of a topic head.

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadSample {
    pub head: u64,
    pub at: Instant,
}

impl HeadSample {
    pub fn new(head: u64) -> Self {
        HeadSample {
            head,
            at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Throughput {
    /// Messages published between the two samples.
    pub published: u64,
    pub rate_hz: f64,
    pub bytes_per_sec: f64,
}

impl Throughput {
    /// Throughput between `prev` and `next`. A zero interval or an idle topic
    /// yields the zero state.
    pub fn between(prev: &HeadSample, next: &HeadSample, slot_size: usize) -> Self {
        let published = next.head.wrapping_sub(prev.head);
        let elapsed = next.at.saturating_duration_since(prev.at).as_secs_f64();
        if published == 0 || elapsed <= 0.0 {
            return Throughput::default();
        }

        let rate_hz = published as f64 / elapsed;
        Throughput {
            published,
            rate_hz,
            bytes_per_sec: rate_hz * slot_size as f64,
        }
    }

    pub fn kib_per_sec(&self) -> f64 {
        self.bytes_per_sec / 1024.0
    }
}
