use crate::{Acceptor, CancellationToken, EchoUnit, Result, Transport, UnitGroup, UnitReport};
use crossbeam::channel::Sender;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_RECORD_SIZE: usize = 4096;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub record_size: usize,
    /// How long in-flight units may keep running after the token fires
    /// before their connections are shut down.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            record_size: DEFAULT_RECORD_SIZE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub spawn_failures: u64,
    pub reaped: u64,
    /// Units still running after the grace period whose connection was
    /// shut down.
    pub terminated: u64,
}

/// Fixed-record echo server, one thread per accepted connection.
pub struct EchoServer {
    config: ServerConfig,
    reports: Option<Sender<UnitReport>>,
}

impl EchoServer {
    pub fn new(config: ServerConfig) -> Self {
        EchoServer {
            config,
            reports: None,
        }
    }

    /// Forwards the report of every finished connection unit to `reports`.
    pub fn report_to(mut self, reports: Sender<UnitReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Serves `listener` until `token` is cancelled, then drains the
    /// connection units.
    ///
    /// Once cancelled no further connections are accepted. Units still
    /// running get `shutdown_grace` to finish on their own; whatever is
    /// left after that has its connection shut down, and every unit is
    /// joined before this returns.
    pub fn serve(&self, listener: Transport, token: &CancellationToken) -> Result<ServerStats> {
        let mut acceptor = Acceptor::new(listener, token)?;
        let group = UnitGroup::new(self.reports.clone())?;
        let mut stats = ServerStats::default();

        info!(record_size = self.config.record_size, "echo server accepting connections");
        let outcome = self.accept_loop(&mut acceptor, &group, &mut stats);
        drop(acceptor);

        let live = group.live();
        if live > 0 {
            info!(
                units = live,
                grace = ?self.config.shutdown_grace,
                "waiting for connection units to finish"
            );
        }
        if !group.wait_idle(self.config.shutdown_grace) {
            stats.terminated = group.terminate_all();
        }
        stats.reaped = group.join();

        outcome?;
        info!(
            accepted = stats.accepted,
            spawn_failures = stats.spawn_failures,
            reaped = stats.reaped,
            terminated = stats.terminated,
            "echo server stopped"
        );
        Ok(stats)
    }

    fn accept_loop(
        &self,
        acceptor: &mut Acceptor,
        group: &UnitGroup,
        stats: &mut ServerStats,
    ) -> Result<()> {
        let record_size = self.config.record_size;
        while let Some(transport) = acceptor.next()? {
            stats.accepted += 1;
            match group.spawn(transport, move |id, transport| {
                EchoUnit::new(id, transport, record_size).run()
            }) {
                Ok(id) => debug!(unit = id, live = group.live(), "connection accepted"),
                Err(e) => {
                    stats.spawn_failures += 1;
                    warn!(error = %e, "failed to spawn connection unit");
                }
            }
        }
        Ok(())
    }
}
