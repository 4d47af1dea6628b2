//! The boundary between a connection and the outside world.
//!
//! A connection never touches sockets or application buffers directly. The
//! embedding supplies an [`Endpoint`] that reads application input, puts
//! segments on the unreliable network and accepts delivered output.

use std::io;

use crate::error::CtcpError;

/// Result of polling the application for more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// `n` bytes were written into the buffer.
    Data(usize),
    /// Nothing is available right now.
    Pending,
    /// The application has no more data to send.
    Eof,
}

/// Collaborators of a single connection.
///
/// Implementations are called from the sender task, the receive path and the
/// timer sweep, sometimes while connection locks are held. They must not call
/// back into the same connection.
pub trait Endpoint: Send + Sync {
    /// Read up to `buf.len()` bytes of application input. An error is treated
    /// as end of input.
    fn read_input(&self, buf: &mut [u8]) -> io::Result<Input>;

    /// Hand one encoded segment to the unreliable network.
    fn send_bytes(&self, segment: &[u8]) -> io::Result<()>;

    /// Offer in-order bytes to the application. Returns how many were
    /// accepted; the rest are offered again later.
    fn deliver_output(&self, data: &[u8]) -> usize;

    /// The peer's stream has ended. Called at most once.
    fn finish_output(&self);

    /// The connection was torn down abnormally.
    fn connection_reset(&self, reason: &CtcpError);

    /// Release the underlying transport. Called once, when the connection is
    /// destroyed.
    fn release(&self);
}
