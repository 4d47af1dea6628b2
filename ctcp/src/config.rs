//! Per-connection configuration.
//!
//! Defaults follow the classic cTCP lab settings: a stop-and-wait window of a
//! single maximum-sized segment, a 200 ms retransmission timeout and a 40 ms
//! timer cadence.

use std::time::Duration;

use crate::error::{CtcpError, Result};
use crate::segment::MAX_PAYLOAD;

/// Default largest payload carried by one segment.
pub const MAX_SEG_DATA_SIZE: usize = 1440;

/// Retransmission interval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every retry waits `retransmission_timeout`.
    #[default]
    Fixed,
    /// Each retry doubles the previous interval, capped at `max`.
    Exponential { max: Duration },
}

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Receive capacity advertised to the peer, in bytes, counted from the
    /// next byte owed to the sink. Payload past that point is discarded.
    pub recv_window: usize,
    /// Upper bound on unacknowledged payload bytes.
    pub send_window: usize,
    /// Age of an unacknowledged segment before it is resent.
    pub retransmission_timeout: Duration,
    /// Number of resends of one segment before the connection is declared
    /// dead.
    pub max_retransmissions: u32,
    /// Largest payload placed in a single segment.
    pub max_segment_payload: usize,
    /// Cadence of the spawned retransmission sweep.
    pub timer_interval: Duration,
    /// Delay between reaching `Closed` and destroying the connection.
    pub linger: Duration,
    pub backoff: Backoff,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_window: MAX_SEG_DATA_SIZE,
            send_window: MAX_SEG_DATA_SIZE,
            retransmission_timeout: Duration::from_millis(200),
            max_retransmissions: 5,
            max_segment_payload: MAX_SEG_DATA_SIZE,
            timer_interval: Duration::from_millis(40),
            linger: Duration::from_millis(400),
            backoff: Backoff::Fixed,
        }
    }
}

impl ConnectionConfig {
    /// Create with custom receive and send windows, other options default.
    pub fn with_windows(recv_window: usize, send_window: usize) -> Self {
        Self {
            recv_window,
            send_window,
            ..Self::default()
        }
    }

    /// Check the option combination.
    pub fn validate(&self) -> Result<()> {
        if self.recv_window == 0 || self.recv_window > u16::MAX as usize {
            return Err(CtcpError::InvalidConfig(format!(
                "recv_window must be in 1..={}, got {}",
                u16::MAX,
                self.recv_window
            )));
        }
        if self.max_segment_payload == 0 || self.max_segment_payload > MAX_PAYLOAD {
            return Err(CtcpError::InvalidConfig(format!(
                "max_segment_payload must be in 1..={MAX_PAYLOAD}, got {}",
                self.max_segment_payload
            )));
        }
        // A full segment must fit, or the sender could never make progress.
        if self.send_window < self.max_segment_payload {
            return Err(CtcpError::InvalidConfig(format!(
                "send_window ({}) is smaller than max_segment_payload ({})",
                self.send_window, self.max_segment_payload
            )));
        }
        if self.retransmission_timeout.is_zero() {
            return Err(CtcpError::InvalidConfig(
                "retransmission_timeout must be non-zero".into(),
            ));
        }
        if self.timer_interval.is_zero() {
            return Err(CtcpError::InvalidConfig("timer_interval must be non-zero".into()));
        }
        if let Backoff::Exponential { max } = self.backoff {
            if max < self.retransmission_timeout {
                return Err(CtcpError::InvalidConfig(
                    "backoff cap is below retransmission_timeout".into(),
                ));
            }
        }
        Ok(())
    }

    /// Timeout that applies to a segment already resent `retries` times.
    pub fn timeout_for(&self, retries: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retransmission_timeout,
            Backoff::Exponential { max } => {
                let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
                self.retransmission_timeout
                    .checked_mul(factor)
                    .map_or(max, |t| t.min(max))
            }
        }
    }

    /// The receive window as carried in the 16-bit header field.
    pub fn advertised_window(&self) -> u16 {
        self.recv_window.min(u16::MAX as usize) as u16
    }
}
