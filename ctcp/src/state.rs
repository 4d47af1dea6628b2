//! Teardown state machine.
//!
//! A connection starts `Established` and reaches `Closed` once both
//! directions have exchanged a FIN and its acknowledgment:
//!
//! ```text
//! Established --local FIN--> FinSent  --FIN acked--> FinAcked --peer FIN--> Closed
//! Established --peer FIN---> CloseWait --local FIN--> LastAck --FIN acked--> Closed
//! FinSent     --peer FIN---> Closing  --FIN acked--> Closed
//! ```

use std::fmt;

use crate::error::{CtcpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Both directions open.
    Established,
    /// Our FIN is out; the peer may still send.
    FinSent,
    /// Our FIN was acknowledged; waiting for the peer's FIN.
    FinAcked,
    /// The peer finished; we may still send.
    CloseWait,
    /// Both FINs sent, ours not yet acknowledged.
    LastAck,
    /// Simultaneous close: our FIN crossed the peer's.
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Established => write!(f, "Established"),
            ConnectionState::FinSent => write!(f, "FinSent"),
            ConnectionState::FinAcked => write!(f, "FinAcked"),
            ConnectionState::CloseWait => write!(f, "CloseWait"),
            ConnectionState::LastAck => write!(f, "LastAck"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Events that drive teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Local input ended and our FIN was queued.
    LocalFin,
    /// The peer's FIN was delivered.
    PeerFin,
    /// The peer acknowledged our FIN.
    FinAcked,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::LocalFin => write!(f, "local FIN"),
            Event::PeerFin => write!(f, "peer FIN"),
            Event::FinAcked => write!(f, "FIN acked"),
        }
    }
}

impl ConnectionState {
    /// The state reached by applying `event`.
    pub fn on(self, event: Event) -> Result<ConnectionState> {
        use ConnectionState::*;

        let next = match (self, event) {
            (Established, Event::LocalFin) => FinSent,
            (Established, Event::PeerFin) => CloseWait,
            (FinSent, Event::FinAcked) => FinAcked,
            (FinSent, Event::PeerFin) => Closing,
            (FinAcked, Event::PeerFin) => Closed,
            (CloseWait, Event::LocalFin) => LastAck,
            (LastAck, Event::FinAcked) | (Closing, Event::FinAcked) => Closed,
            (from, event) => {
                return Err(CtcpError::InvalidStateTransition {
                    from: from.to_string(),
                    to: event.to_string(),
                })
            }
        };
        Ok(next)
    }

    /// Whether our FIN has been queued.
    pub fn fin_sent(self) -> bool {
        !matches!(self, ConnectionState::Established | ConnectionState::CloseWait)
    }

    /// Whether our FIN is queued but not yet acknowledged.
    pub fn awaiting_fin_ack(self) -> bool {
        matches!(
            self,
            ConnectionState::FinSent | ConnectionState::LastAck | ConnectionState::Closing
        )
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}
