//! cTCP -- a reliable, ordered, flow-controlled byte stream over an
//! unreliable datagram service.
//!
//! - **Segments**: fixed 18-byte header protected by the Internet checksum
//! - **Sliding window**: unacknowledged payload bounded by `send_window`
//! - **Cumulative ACKs** with retransmission on timeout
//! - **FIN teardown** in both directions, including simultaneous close
//!
//! The network, the application source and the application sink are supplied
//! through the [`Endpoint`] trait. Connections live in a [`Registry`] swept
//! by a [`RetransmissionTimer`].

pub mod checksum;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod receive_buffer;
pub mod registry;
pub mod segment;
pub mod send_window;
pub mod sim;
pub mod state;
pub mod timer;

// Re-export key public types at crate root.
pub use config::{Backoff, ConnectionConfig};
pub use connection::{Connection, ConnectionStats, TimerOutcome};
pub use endpoint::{Endpoint, Input};
pub use error::{CtcpError, Result};
pub use registry::{ConnId, Registry};
pub use segment::{Flags, Segment, SegmentCodec};
pub use state::ConnectionState;
pub use timer::{RetransmissionTimer, SweepReport};
