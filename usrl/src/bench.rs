//! Multi-threaded ping-pong load generator against an echo server.

use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use transport::{Transport, TransportOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub host: String,
    pub port: u16,
    pub threads: usize,
    pub iterations: u64,
    pub payload_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            threads: 4,
            iterations: 1_000_000,
            payload_size: 4096,
        }
    }
}

/// Work done by one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParticipantStats {
    pub completed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BenchReport {
    pub threads: usize,
    pub total: u64,
    pub max_elapsed: Duration,
    pub request_rate: f64,
    pub aggregate_mbps: f64,
}

impl BenchReport {
    /// Aggregates participant results against the slowest participant's
    /// wall time. A zero wall time gives zero rates.
    pub fn aggregate(stats: &[ParticipantStats], payload_size: usize) -> Self {
        let total: u64 = stats.iter().map(|s| s.completed).sum();
        let max_elapsed = stats
            .iter()
            .map(|s| s.elapsed)
            .max()
            .unwrap_or_default();

        let secs = max_elapsed.as_secs_f64();
        let (request_rate, aggregate_mbps) = if secs > 0.0 {
            (
                total as f64 / secs,
                total as f64 * payload_size as f64 * 8.0 / (secs * 1e6),
            )
        } else {
            (0.0, 0.0)
        };

        BenchReport {
            threads: stats.len(),
            total,
            max_elapsed,
            request_rate,
            aggregate_mbps,
        }
    }

    pub fn gigabytes_per_sec(&self) -> f64 {
        self.aggregate_mbps / 8000.0
    }
}

impl std::fmt::Display for BenchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "final result ({} threads):", self.threads)?;
        writeln!(f, "   total requests: {}", self.total)?;
        writeln!(f, "   aggregate rate: {:.2} M req/sec", self.request_rate / 1e6)?;
        write!(
            f,
            "   aggregate bw:   {:.2} Mbps ({:.2} GB/s)",
            self.aggregate_mbps,
            self.gigabytes_per_sec()
        )
    }
}

/// Runs `config.threads` participants to completion, each on its own
/// connection.
pub fn run(config: &BenchConfig) -> BenchReport {
    let stats: Vec<ParticipantStats> = thread::scope(|s| {
        let handles: Vec<_> = (0..config.threads)
            .map(|id| s.spawn(move || participant(id, config)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .collect()
    });
    BenchReport::aggregate(&stats, config.payload_size)
}

fn participant(id: usize, config: &BenchConfig) -> ParticipantStats {
    let options = TransportOptions::tcp_client(&config.host, config.port);
    let mut client = match Transport::create(&options) {
        Ok(client) => client,
        Err(e) => {
            warn!(participant = id, error = %e, "connection failed");
            return ParticipantStats::default();
        }
    };

    let mut payload = vec![0xCCu8; config.payload_size];
    let start = Instant::now();
    let mut completed = 0;
    for _ in 0..config.iterations {
        match client.send(&payload) {
            Ok(n) if n == payload.len() => {}
            other => {
                debug!(participant = id, ?other, "send came up short");
                break;
            }
        }
        match client.recv(&mut payload) {
            Ok(n) if n == payload.len() => {}
            other => {
                debug!(participant = id, ?other, "recv came up short");
                break;
            }
        }
        completed += 1;
    }
    let elapsed = start.elapsed();
    client.destroy();

    debug!(participant = id, completed, ?elapsed, "participant finished");
    ParticipantStats { completed, elapsed }
}
