//! In-memory endpoints and a fault-injecting link.
//!
//! Used by the test suite and benchmarks to run two connections against each
//! other without sockets. [`MemoryEndpoint`] queues outgoing segments on a
//! lock-free queue and records everything the connection hands to the
//! application. [`FaultInjector`] models an unreliable network:
//!
//! | Fault       | Effect                                           |
//! |-------------|--------------------------------------------------|
//! | Loss        | Datagram dropped with probability `loss_rate`.   |
//! | Duplication | Datagram delivered twice.                        |
//! | Corruption  | One random bit flipped.                          |
//! | Reordering  | Datagram held back and released after the next.  |

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::trace;

use crate::connection::Connection;
use crate::endpoint::{Endpoint, Input};
use crate::error::CtcpError;

#[derive(Default)]
struct InputState {
    data: VecDeque<u8>,
    eof: bool,
    failed: bool,
}

#[derive(Default)]
struct OutputState {
    data: Vec<u8>,
    /// Bytes the sink will still accept. `None` means unlimited.
    capacity: Option<usize>,
}

/// An [`Endpoint`] backed by in-memory buffers.
#[derive(Default)]
pub struct MemoryEndpoint {
    input: Mutex<InputState>,
    wire: SegQueue<Bytes>,
    output: Mutex<OutputState>,
    send_failing: AtomicBool,
    finished: AtomicUsize,
    resets: Mutex<Vec<String>>,
    released: AtomicUsize,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `data` available to the next `read_input` calls.
    pub fn write_input(&self, data: &[u8]) {
        self.input.lock().data.extend(data);
    }

    /// Report end of input once buffered input is consumed.
    pub fn close_input(&self) {
        self.input.lock().eof = true;
    }

    /// Fail reads once buffered input is consumed.
    pub fn fail_input(&self) {
        self.input.lock().failed = true;
    }

    /// Remove every segment sent so far.
    pub fn take_wire(&self) -> Vec<Bytes> {
        std::iter::from_fn(|| self.wire.pop()).collect()
    }

    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    /// Make `send_bytes` fail until cleared.
    pub fn set_send_failing(&self, failing: bool) {
        self.send_failing.store(failing, Ordering::Release);
    }

    /// Limit how many more bytes the sink accepts. `None` removes the limit.
    pub fn set_output_capacity(&self, capacity: Option<usize>) {
        self.output.lock().capacity = capacity;
    }

    /// Bytes delivered to the application so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().data.clone()
    }

    pub fn finish_count(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finish_count() > 0
    }

    /// Messages of every reset notification received.
    pub fn resets(&self) -> Vec<String> {
        self.resets.lock().clone()
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }
}

impl Endpoint for MemoryEndpoint {
    fn read_input(&self, buf: &mut [u8]) -> io::Result<Input> {
        let mut input = self.input.lock();
        if !input.data.is_empty() {
            let n = buf.len().min(input.data.len());
            for (dst, src) in buf.iter_mut().zip(input.data.drain(..n)) {
                *dst = src;
            }
            return Ok(Input::Data(n));
        }
        if input.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "input failed"));
        }
        if input.eof {
            return Ok(Input::Eof);
        }
        Ok(Input::Pending)
    }

    fn send_bytes(&self, segment: &[u8]) -> io::Result<()> {
        if self.send_failing.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "network unavailable"));
        }
        self.wire.push(Bytes::copy_from_slice(segment));
        Ok(())
    }

    fn deliver_output(&self, data: &[u8]) -> usize {
        let mut output = self.output.lock();
        let n = output.capacity.map_or(data.len(), |cap| cap.min(data.len()));
        if let Some(cap) = output.capacity.as_mut() {
            *cap -= n;
        }
        output.data.extend_from_slice(&data[..n]);
        n
    }

    fn finish_output(&self) {
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    fn connection_reset(&self, reason: &CtcpError) {
        self.resets.lock().push(reason.to_string());
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Fault probabilities, each in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    pub reorder_rate: f64,
}

impl FaultConfig {
    /// A link that delivers everything exactly once, in order.
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Every fault at the same rate.
    pub fn uniform(rate: f64) -> Self {
        Self {
            loss_rate: rate,
            duplicate_rate: rate,
            corrupt_rate: rate,
            reorder_rate: rate,
        }
    }
}

/// Applies a [`FaultConfig`] to a stream of datagrams.
#[derive(Debug, Default)]
pub struct FaultInjector {
    config: FaultConfig,
    held: Option<Bytes>,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        Self { config, held: None }
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    /// Datagrams to deliver, in order, in place of `datagram`.
    pub fn apply(&mut self, datagram: Bytes) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(3);
        if roll(self.config.loss_rate) {
            trace!(len = datagram.len(), "fault: drop");
            return out;
        }

        let datagram = if roll(self.config.corrupt_rate) {
            corrupt(&datagram)
        } else {
            datagram
        };
        let copies = if roll(self.config.duplicate_rate) { 2 } else { 1 };

        if self.held.is_none() && roll(self.config.reorder_rate) {
            trace!(len = datagram.len(), "fault: hold for reordering");
            if copies == 2 {
                out.push(datagram.clone());
            }
            self.held = Some(datagram);
            return out;
        }

        for _ in 0..copies {
            out.push(datagram.clone());
        }
        out.extend(self.held.take());
        out
    }

    /// Release a datagram held for reordering, if any.
    pub fn flush(&mut self) -> Option<Bytes> {
        self.held.take()
    }
}

fn roll(rate: f64) -> bool {
    rate > 0.0 && rand::random::<f64>() < rate
}

fn corrupt(datagram: &Bytes) -> Bytes {
    if datagram.is_empty() {
        return datagram.clone();
    }
    let mut buf = BytesMut::from(&datagram[..]);
    let idx = rand::random::<u64>() as usize % buf.len();
    buf[idx] ^= 1 << (rand::random::<u8>() % 8);
    trace!(idx, "fault: corrupt");
    buf.freeze()
}

/// Move every segment `from` has sent through `link` into `to`. Returns the
/// number of datagrams handed to `to`.
///
/// Receive errors are expected on a faulty link and are ignored.
pub fn pump(from: &MemoryEndpoint, to: &Connection, link: &mut FaultInjector) -> usize {
    let mut delivered = 0;
    for datagram in from.take_wire() {
        for copy in link.apply(datagram) {
            delivered += 1;
            if let Err(e) = to.receive(&copy) {
                trace!(conn = to.id(), error = %e, "pumped datagram rejected");
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_drains_then_reports_eof() {
        let ep = MemoryEndpoint::new();
        ep.write_input(b"abcdef");
        ep.close_input();
        let mut buf = [0u8; 4];
        assert_eq!(ep.read_input(&mut buf).unwrap(), Input::Data(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(ep.read_input(&mut buf).unwrap(), Input::Data(2));
        assert_eq!(ep.read_input(&mut buf).unwrap(), Input::Eof);
    }

    #[test]
    fn pending_without_input() {
        let ep = MemoryEndpoint::new();
        assert_eq!(ep.read_input(&mut [0u8; 8]).unwrap(), Input::Pending);
        ep.fail_input();
        assert!(ep.read_input(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn output_capacity_limits_acceptance() {
        let ep = MemoryEndpoint::new();
        ep.set_output_capacity(Some(3));
        assert_eq!(ep.deliver_output(b"hello"), 3);
        assert_eq!(ep.deliver_output(b"lo"), 0);
        ep.set_output_capacity(None);
        assert_eq!(ep.deliver_output(b"lo"), 2);
        assert_eq!(ep.output(), b"hello");
    }

    #[test]
    fn reliable_link_passes_through() {
        let mut link = FaultInjector::new(FaultConfig::reliable());
        let out = link.apply(Bytes::from_static(b"segment"));
        assert_eq!(out, vec![Bytes::from_static(b"segment")]);
        assert!(link.flush().is_none());
    }

    #[test]
    fn total_loss_drops_everything() {
        let mut link = FaultInjector::new(FaultConfig {
            loss_rate: 1.0,
            ..FaultConfig::default()
        });
        assert!(link.apply(Bytes::from_static(b"gone")).is_empty());
    }

    #[test]
    fn reorder_swaps_adjacent_datagrams() {
        let mut link = FaultInjector::new(FaultConfig {
            reorder_rate: 1.0,
            ..FaultConfig::default()
        });
        assert!(link.apply(Bytes::from_static(b"first")).is_empty());
        let out = link.apply(Bytes::from_static(b"second"));
        assert_eq!(
            out,
            vec![Bytes::from_static(b"second"), Bytes::from_static(b"first")]
        );
    }

    #[test]
    fn corruption_flips_one_bit() {
        let mut link = FaultInjector::new(FaultConfig {
            corrupt_rate: 1.0,
            ..FaultConfig::default()
        });
        let original = Bytes::from_static(b"payload bytes");
        let out = link.apply(original.clone());
        let flipped: u32 = out[0]
            .iter()
            .zip(original.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert_eq!(flipped, 1);
    }
}
