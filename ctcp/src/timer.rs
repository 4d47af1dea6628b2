//! Periodic retransmission sweep across every registered connection.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::connection::TimerOutcome;
use crate::registry::Registry;

/// Totals from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Segments resent.
    pub retransmitted: usize,
    /// Connections skipped because their inflight set was busy.
    pub skipped: usize,
    /// Connections destroyed, by retransmission exhaustion or linger expiry.
    pub torn_down: usize,
}

pub struct RetransmissionTimer {
    registry: Registry,
    interval: Duration,
}

impl RetransmissionTimer {
    pub fn new(registry: Registry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Sweep at the configuration's `timer_interval`.
    pub fn from_config(registry: Registry, config: &ConnectionConfig) -> Self {
        Self::new(registry, config.timer_interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass over a snapshot of the registry.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.registry.snapshot() {
            match conn.on_timer(now) {
                TimerOutcome::Idle => {}
                TimerOutcome::Skipped => report.skipped += 1,
                TimerOutcome::Retransmitted(n) => report.retransmitted += n,
                TimerOutcome::Dead { .. } | TimerOutcome::LingerExpired => report.torn_down += 1,
            }
        }
        if report != SweepReport::default() {
            debug!(
                retransmitted = report.retransmitted,
                skipped = report.skipped,
                torn_down = report.torn_down,
                "sweep"
            );
        }
        report
    }

    /// Sweep every `interval` on the current tokio runtime until the handle
    /// is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!("retransmission tick");
                self.sweep(Instant::now());
            }
        })
    }
}
