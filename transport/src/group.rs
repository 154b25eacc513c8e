//! Live connection units and the reaper thread that joins them.
//!
//! Every unit thread reports its id on a completion channel when it exits,
//! including by panic. The reaper blocks for one completion, drains every
//! completion already queued and joins that whole batch in one pass.
//! Spawning a unit and registering it happen under the same lock the reaper
//! takes, so a unit that finishes immediately is never reaped before it is
//! registered.

use crate::{Result, Terminator, Transport, UnitReport};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

enum ReapEvent {
    Done(u64),
    Stop,
}

struct LiveUnit {
    handle: JoinHandle<UnitReport>,
    terminator: Terminator,
}

#[derive(Default)]
struct Units {
    live: HashMap<u64, LiveUnit>,
    /// Removed from `live` but not joined yet.
    reaping: usize,
}

impl Units {
    fn is_idle(&self) -> bool {
        self.live.is_empty() && self.reaping == 0
    }
}

#[derive(Default)]
struct Shared {
    units: Mutex<Units>,
    idle: Condvar,
    reaped: AtomicU64,
    passes: AtomicU64,
    panicked: AtomicU64,
}

/// Signals completion of one unit when dropped.
struct CompletionGuard {
    id: u64,
    tx: Sender<ReapEvent>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(ReapEvent::Done(self.id));
    }
}

pub struct UnitGroup {
    shared: Arc<Shared>,
    tx: Sender<ReapEvent>,
    reaper: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl UnitGroup {
    /// Starts the reaper. Reports of finished units are forwarded to
    /// `reports` when given.
    pub fn new(reports: Option<Sender<UnitReport>>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = unbounded();

        let reaper_shared = shared.clone();
        let reaper = thread::Builder::new()
            .name("unit-reaper".to_string())
            .spawn(move || reaper_thread(rx, reaper_shared, reports))?;

        Ok(UnitGroup {
            shared,
            tx,
            reaper: Some(reaper),
            next_id: AtomicU64::new(1),
        })
    }

    /// Runs `run` on a new thread that owns `transport`. On failure the
    /// transport is dropped, releasing the connection.
    ///
    /// A unit is only started once its connection can be shut down from
    /// here, so [`UnitGroup::terminate_all`] reaches every live unit.
    pub fn spawn<F>(&self, transport: Transport, run: F) -> Result<u64>
    where
        F: FnOnce(u64, Transport) -> UnitReport + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let terminator = transport.terminator()?;
        let guard = CompletionGuard {
            id,
            tx: self.tx.clone(),
        };

        let mut units = self.shared.units.lock();
        let handle = thread::Builder::new()
            .name(format!("unit-{id}"))
            .spawn(move || {
                let _guard = guard;
                run(id, transport)
            })?;
        units.live.insert(id, LiveUnit { handle, terminator });
        Ok(id)
    }

    pub fn live(&self) -> usize {
        self.shared.units.lock().live.len()
    }

    pub fn reaped(&self) -> u64 {
        self.shared.reaped.load(Ordering::Relaxed)
    }

    /// Number of reaper passes so far. Completions that arrive together are
    /// joined in the same pass.
    pub fn reap_passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }

    /// Waits until every unit has been reaped, or `timeout` elapses.
    /// Returns whether the group is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut units = self.shared.units.lock();
        !self
            .shared
            .idle
            .wait_while_for(&mut units, |units| !units.is_idle(), timeout)
            .timed_out()
    }

    /// Shuts down the connection of every live unit so pending transfers
    /// return. Units whose thread has already exited are waiting for the
    /// reaper and are left alone. Returns the number of units signalled.
    pub fn terminate_all(&self) -> u64 {
        let units = self.shared.units.lock();
        let mut signalled = 0;
        for (id, unit) in units.live.iter() {
            if unit.handle.is_finished() {
                continue;
            }
            match unit.terminator.terminate() {
                Ok(()) => signalled += 1,
                Err(e) => warn!(unit = id, error = %e, "failed to terminate connection unit"),
            }
        }
        if signalled > 0 {
            info!(units = signalled, "terminated remaining connection units");
        }
        signalled
    }

    /// Waits for every unit to be reaped, then stops the reaper. Returns
    /// the total number of units reaped.
    pub fn join(mut self) -> u64 {
        self.stop();
        self.reaped()
    }

    fn stop(&mut self) {
        let Some(reaper) = self.reaper.take() else {
            return;
        };
        {
            let mut units = self.shared.units.lock();
            self.shared.idle.wait_while(&mut units, |units| !units.is_idle());
        }
        let _ = self.tx.send(ReapEvent::Stop);
        if reaper.join().is_err() {
            warn!("unit reaper panicked");
        }
    }
}

impl Drop for UnitGroup {
    fn drop(&mut self) {
        if self.reaper.is_some() {
            self.terminate_all();
            self.stop();
        }
    }
}

fn reaper_thread(
    rx: Receiver<ReapEvent>,
    shared: Arc<Shared>,
    reports: Option<Sender<UnitReport>>,
) {
    debug!("unit reaper started");
    while let Ok(first) = rx.recv() {
        let mut stop = false;
        let mut batch = Vec::new();
        for event in std::iter::once(first).chain(rx.try_iter()) {
            match event {
                ReapEvent::Done(id) => batch.push(id),
                ReapEvent::Stop => stop = true,
            }
        }

        if !batch.is_empty() {
            reap(&batch, &shared, reports.as_ref());
        }
        if stop {
            break;
        }
    }
    debug!("unit reaper stopped");
}

fn reap(batch: &[u64], shared: &Shared, reports: Option<&Sender<UnitReport>>) {
    let finished: Vec<(u64, LiveUnit)> = {
        let mut units = shared.units.lock();
        let finished: Vec<_> = batch
            .iter()
            .filter_map(|id| units.live.remove(id).map(|unit| (*id, unit)))
            .collect();
        units.reaping += finished.len();
        finished
    };
    let count = finished.len();

    for (id, unit) in finished {
        match unit.handle.join() {
            Ok(report) => {
                debug!(
                    unit = id,
                    records = report.records,
                    reason = ?report.reason,
                    "reaped connection unit"
                );
                if let Some(reports) = reports {
                    let _ = reports.send(report);
                }
            }
            Err(_) => {
                warn!(unit = id, "connection unit panicked");
                shared.panicked.fetch_add(1, Ordering::Relaxed);
            }
        }
        shared.reaped.fetch_add(1, Ordering::Relaxed);
    }
    shared.passes.fetch_add(1, Ordering::Relaxed);

    let mut units = shared.units.lock();
    units.reaping -= count;
    if units.is_idle() {
        shared.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CloseReason, TransportError, TransportOptions};
    use crossbeam::channel::bounded;
    use rstest::*;
    use std::sync::Barrier;

    fn pair() -> (Transport, Transport) {
        let server =
            Transport::create(&TransportOptions::tcp_server(Some("127.0.0.1"), 0)).unwrap();
        let port = server.local_addr().unwrap().port();
        let client =
            Transport::create(&TransportOptions::tcp_client("127.0.0.1", port)).unwrap();
        let accepted = server.accept().unwrap();
        (client, accepted)
    }

    fn report(id: u64) -> UnitReport {
        UnitReport {
            id,
            records: 0,
            reason: CloseReason::OrderlyClose,
        }
    }

    #[rstest]
    #[case(1)]
    #[case(8)]
    fn test_simultaneous_completions_reaped_in_one_pass(#[case] count: usize) -> Result<()> {
        let (reports_tx, reports_rx) = unbounded();
        let group = UnitGroup::new(Some(reports_tx))?;
        let release = Arc::new(Barrier::new(count + 1));
        let mut keep = Vec::new();

        for _ in 0..count {
            let (client, accepted) = pair();
            keep.push(client);
            let release = release.clone();
            group.spawn(accepted, move |id, _transport| {
                release.wait();
                report(id)
            })?;
        }

        {
            // Units finish and queue completions while the reaper is held
            // off the unit table.
            let _hold = group.shared.units.lock();
            release.wait();
            std::thread::sleep(Duration::from_millis(100));
        }

        assert!(group.wait_idle(Duration::from_secs(5)));
        assert_eq!(group.reaped(), count as u64);
        assert!(group.reap_passes() <= 2);
        assert_eq!(reports_rx.try_iter().count(), count);
        group.join();
        Ok(())
    }

    #[test]
    fn test_panicking_unit_is_reaped() -> Result<()> {
        let group = UnitGroup::new(None)?;
        let (_client, accepted) = pair();
        group.spawn(accepted, |_, _| panic!("unit failure"))?;

        assert!(group.wait_idle(Duration::from_secs(5)));
        assert_eq!(group.reaped(), 1);
        assert_eq!(group.panicked(), 1);
        Ok(())
    }

    #[test]
    fn test_terminate_wakes_blocked_units() -> Result<()> {
        let (reports_tx, reports_rx) = unbounded();
        let group = UnitGroup::new(Some(reports_tx))?;
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, accepted) = pair();
            clients.push(client);
            group.spawn(accepted, |id, transport| {
                crate::EchoUnit::new(id, transport, 64).run()
            })?;
        }

        assert!(!group.wait_idle(Duration::from_millis(50)));
        assert_eq!(group.terminate_all(), 3);
        assert!(group.wait_idle(Duration::from_secs(5)));

        let reports: Vec<_> = reports_rx.try_iter().collect();
        assert_eq!(reports.len(), 3);
        assert!(reports
            .iter()
            .all(|r| matches!(r.reason, CloseReason::OrderlyClose)));
        group.join();
        Ok(())
    }

    #[test]
    fn test_unit_finishing_during_spawn_is_not_lost() -> Result<()> {
        let group = UnitGroup::new(None)?;
        let (done_tx, done_rx) = bounded(64);
        let mut clients = Vec::new();
        for _ in 0..32 {
            let (client, accepted) = pair();
            clients.push(client);
            let done_tx = done_tx.clone();
            group.spawn(accepted, move |id, _| {
                let _ = done_tx.send(id);
                report(id)
            })?;
        }
        assert_eq!(done_rx.iter().take(32).count(), 32);
        assert!(group.wait_idle(Duration::from_secs(5)));
        assert_eq!(group.reaped(), 32);
        Ok(())
    }

    #[test]
    fn test_unit_without_terminator_is_not_started() -> Result<()> {
        let group = UnitGroup::new(None)?;
        let (_client, mut accepted) = pair();
        accepted.destroy();

        let (ran_tx, ran_rx) = bounded(1);
        let result = group.spawn(accepted, move |id, _| {
            let _ = ran_tx.send(id);
            report(id)
        });

        assert!(matches!(result, Err(TransportError::Destroyed)));
        assert_eq!(group.live(), 0);
        assert!(ran_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(group.wait_idle(Duration::from_secs(1)));
        assert_eq!(group.join(), 0);
        Ok(())
    }

    #[test]
    fn test_terminate_skips_units_already_exited() -> Result<()> {
        let (reports_tx, reports_rx) = bounded(0);
        let group = UnitGroup::new(Some(reports_tx))?;
        let wait_for = |done: &dyn Fn(&Units) -> bool| {
            let start = std::time::Instant::now();
            while !done(&*group.shared.units.lock()) {
                assert!(start.elapsed() < Duration::from_secs(5));
                std::thread::sleep(Duration::from_millis(5));
            }
        };

        // The reaper stalls handing over the first report, so later
        // completions stay queued.
        let (_first_client, first) = pair();
        group.spawn(first, |id, _| report(id))?;
        wait_for(&|units| units.reaping == 1);

        let (_exited_client, exited) = pair();
        let exited_id = group.spawn(exited, |id, _| report(id))?;
        wait_for(&|units| units.live[&exited_id].handle.is_finished());

        let (_idle_client, idle) = pair();
        group.spawn(idle, |id, transport| {
            crate::EchoUnit::new(id, transport, 64).run()
        })?;

        assert_eq!(group.live(), 2);
        assert_eq!(group.terminate_all(), 1);

        for _ in 0..3 {
            reports_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(group.wait_idle(Duration::from_secs(5)));
        assert_eq!(group.join(), 3);
        Ok(())
    }
}
