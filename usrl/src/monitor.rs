//! Read-only observer that samples every topic head of a segment.

use std::fmt::Write;
use topicring::{AccessMode, HeadSample, Registry, Throughput, TopicHandle};

#[derive(Debug, Clone, PartialEq)]
pub struct TopicRow {
    pub name: String,
    pub mode: AccessMode,
    pub slot_size: usize,
    pub throughput: Throughput,
    pub total: u64,
}

pub struct Monitor {
    registry: Registry,
    topics: Vec<(TopicHandle, HeadSample)>,
}

impl Monitor {
    /// Maps `segment` read-only and records the starting head of every topic.
    pub fn open(segment: &str) -> topicring::Result<Self> {
        Ok(Monitor::new(Registry::open_read_only(segment)?))
    }

    pub fn new(registry: Registry) -> Self {
        let topics = registry
            .handles()
            .map(|topic| {
                let sample = HeadSample::new(topic.read_head());
                (topic, sample)
            })
            .collect();
        Monitor { registry, topics }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Samples every head and returns the throughput since the previous
    /// sample.
    pub fn sample(&mut self) -> Vec<TopicRow> {
        self.topics
            .iter_mut()
            .map(|(topic, prev)| {
                let next = HeadSample::new(topic.read_head());
                let throughput = Throughput::between(prev, &next, topic.slot_size());
                *prev = next;
                TopicRow {
                    name: topic.name().to_string(),
                    mode: topic.mode(),
                    slot_size: topic.slot_size(),
                    throughput,
                    total: next.head,
                }
            })
            .collect()
    }

    pub fn render(&self, rows: &[TopicRow]) -> String {
        render_table(self.registry.name(), self.registry.mapped_size(), rows)
    }
}

pub fn render_table(segment: &str, mapped_size: usize, rows: &[TopicRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "usrl monitor | segment {} | memory {:.2} MB | topics {}",
        segment,
        mapped_size as f64 / (1024.0 * 1024.0),
        rows.len()
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<20} {:<6} {:<8} {:<14} {:<14} {:<12}",
        "TOPIC", "TYPE", "SIZE", "RATE", "BW", "TOTAL"
    );
    let _ = writeln!(out, "{}", "-".repeat(79));
    for row in rows {
        let _ = writeln!(
            out,
            "{:<20} {:<6} {:<8} {:<14} {:<14} {:<12}",
            row.name,
            row.mode.short_name(),
            row.slot_size,
            format!("{:.1} Hz", row.throughput.rate_hz),
            format!("{:.1} KB/s", row.throughput.kib_per_sec()),
            row.total
        );
    }
    out
}
