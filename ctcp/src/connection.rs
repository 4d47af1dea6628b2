//! A single cTCP connection.
//!
//! Three paths touch a connection concurrently: the application-facing
//! [`Connection::read`] path and its sender task, the network-facing
//! [`Connection::receive`] path, and the periodic [`Connection::on_timer`]
//! sweep. Each piece of state has its own lock; when two are held together
//! the order is outbound, then inflight.
//!
//! Segments reach the endpoint only while the outbound or inflight lock is
//! held, and application data only under the receive lock. `destroy` takes
//! all three after raising its flag and before releasing the endpoint, so no
//! callback other than a reset notice runs once the endpoint is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::endpoint::{Endpoint, Input};
use crate::error::{CtcpError, Result};
use crate::receive_buffer::{Delivery, Insert, ReceiveBuffer};
use crate::registry::{ConnId, RegistryInner};
use crate::segment::{Flags, Segment, INITIAL_SEQ_NO};
use crate::send_window::{AckOutcome, Expiry, InflightSet, OutboundQueue};
use crate::state::{ConnectionState, Event};

/// Longest the timer waits for a busy inflight set before skipping it.
const TIMER_LOCK_WAIT: Duration = Duration::from_millis(2);

/// What one timer pass did to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Nothing was due.
    Idle,
    /// The inflight set was busy.
    Skipped,
    /// This many segments were resent.
    Retransmitted(usize),
    /// A segment ran out of retransmissions and the connection was torn down.
    Dead { seqno: u32, retries: u32 },
    /// The linger period after `Closed` elapsed and the connection was
    /// destroyed.
    LingerExpired,
}

/// Point-in-time view of a connection's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub next_seq_no: u32,
    pub last_ack_sent: u32,
    pub last_ack_received: u32,
    /// Window we advertise to the peer.
    pub advertised_window: u16,
    /// Window the peer last advertised to us.
    pub peer_window: usize,
    pub bytes_inflight: usize,
    /// Sum of payload lengths over the inflight set.
    pub inflight_payload: usize,
    pub inflight_segments: usize,
    pub outbound_segments: usize,
    pub buffered: usize,
}

enum Transmit {
    Sent,
    WindowFull,
    Empty,
    Stopped,
}

struct Teardown {
    state: ConnectionState,
    closed_at: Option<Instant>,
}

pub struct Connection {
    id: ConnId,
    config: ConnectionConfig,
    endpoint: Arc<dyn Endpoint>,
    registry: Weak<RegistryInner>,
    outbound: Mutex<OutboundQueue>,
    inflight: Mutex<InflightSet>,
    received: Mutex<ReceiveBuffer>,
    teardown: Mutex<Teardown>,
    /// Mirror of the receive buffer's next expected seqno.
    last_ack_sent: AtomicU32,
    /// Mirror of the receive buffer's free window.
    advertised_window: AtomicU16,
    sender_running: AtomicBool,
    sender: Mutex<Option<JoinHandle<()>>>,
    /// Signalled whenever an acknowledgment frees window space.
    window_open: Notify,
    destroyed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        endpoint: Arc<dyn Endpoint>,
        config: ConnectionConfig,
        registry: Weak<RegistryInner>,
    ) -> Self {
        let window = config.advertised_window();
        Self {
            id,
            outbound: Mutex::new(OutboundQueue::new(window, config.max_segment_payload)),
            inflight: Mutex::new(InflightSet::new()),
            received: Mutex::new(ReceiveBuffer::new(config.recv_window)),
            teardown: Mutex::new(Teardown {
                state: ConnectionState::Established,
                closed_at: None,
            }),
            last_ack_sent: AtomicU32::new(INITIAL_SEQ_NO),
            advertised_window: AtomicU16::new(window),
            sender_running: AtomicBool::new(false),
            sender: Mutex::new(None),
            window_open: Notify::new(),
            destroyed: AtomicBool::new(false),
            config,
            endpoint,
            registry,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.teardown.lock().state
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn sender_running(&self) -> bool {
        self.sender_running.load(Ordering::Acquire)
    }

    pub fn last_ack_sent(&self) -> u32 {
        self.last_ack_sent.load(Ordering::Acquire)
    }

    pub fn advertised_window(&self) -> u16 {
        self.advertised_window.load(Ordering::Acquire)
    }

    pub fn last_ack_received(&self) -> u32 {
        self.inflight.lock().last_ack_received()
    }

    pub fn bytes_inflight(&self) -> usize {
        self.inflight.lock().bytes_inflight()
    }

    /// Sequence number of our FIN, once queued.
    pub fn fin_seqno(&self) -> Option<u32> {
        self.outbound.lock().fin_seqno()
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.state();
        let mut stats = {
            let out = self.outbound.lock();
            let inflight = self.inflight.lock();
            ConnectionStats {
                state,
                next_seq_no: out.next_seq_no(),
                last_ack_sent: 0,
                last_ack_received: inflight.last_ack_received(),
                advertised_window: 0,
                peer_window: inflight.peer_window(),
                bytes_inflight: inflight.bytes_inflight(),
                inflight_payload: inflight.iter().map(|e| e.payload_len()).sum(),
                inflight_segments: inflight.len(),
                outbound_segments: out.len(),
                buffered: 0,
            }
        };
        let received = self.received.lock();
        stats.last_ack_sent = received.last_ack_sent();
        stats.advertised_window = received.window();
        stats.buffered = received.buffered();
        stats
    }

    /// Pull all available application input into segments and start the
    /// sender.
    ///
    /// End of input, or an input error, queues the connection's FIN.
    pub fn read(self: &Arc<Self>) -> Result<()> {
        self.ensure_live()?;
        if self.fin_seqno().is_some() {
            return Ok(());
        }

        let mut buf = vec![0u8; self.config.max_segment_payload];
        loop {
            match self.endpoint.read_input(&mut buf) {
                Ok(Input::Data(0)) | Ok(Input::Pending) => break,
                Ok(Input::Data(n)) => {
                    let n = n.min(buf.len());
                    let ackno = self.last_ack_sent();
                    let seqno = {
                        let mut out = self.outbound.lock();
                        out.set_window(self.advertised_window());
                        out.push_data(Bytes::copy_from_slice(&buf[..n]), ackno)?
                    };
                    trace!(conn = self.id, seqno, len = n, "queued data");
                }
                Ok(Input::Eof) => {
                    self.queue_fin()?;
                    break;
                }
                Err(e) => {
                    debug!(conn = self.id, error = %e, "input failed, closing our side");
                    self.queue_fin()?;
                    break;
                }
            }
        }

        self.start_sender()
    }

    fn queue_fin(&self) -> Result<()> {
        let ackno = self.last_ack_sent();
        let seqno = {
            let mut out = self.outbound.lock();
            out.set_window(self.advertised_window());
            out.push_fin(ackno)?
        };
        debug!(conn = self.id, seqno, "queued FIN");
        self.advance(Event::LocalFin)?;
        Ok(())
    }

    /// Ensure a sender task is draining the outbound queue. Starting while one
    /// already runs is a no-op.
    pub fn start_sender(self: &Arc<Self>) -> Result<()> {
        if self.outbound.lock().is_empty() {
            return Ok(());
        }
        if self
            .sender_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let mut slot = self.sender.lock();
        if self.is_destroyed() {
            self.sender_running.store(false, Ordering::Release);
            return Err(CtcpError::ConnectionClosed(self.id));
        }
        let Ok(handle) = Handle::try_current() else {
            self.sender_running.store(false, Ordering::Release);
            return Err(CtcpError::NoRuntime);
        };
        let conn = Arc::clone(self);
        *slot = Some(handle.spawn(conn.run_sender()));
        Ok(())
    }

    async fn run_sender(self: Arc<Self>) {
        loop {
            match self.transmit_next() {
                Transmit::Sent => {}
                Transmit::WindowFull => self.window_open.notified().await,
                Transmit::Empty => {
                    self.sender_running.store(false, Ordering::Release);
                    // A write may have queued more after the queue was seen empty.
                    let refill = !self.outbound.lock().is_empty();
                    if !refill
                        || self
                            .sender_running
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        return;
                    }
                }
                Transmit::Stopped => return,
            }
        }
    }

    /// Move the oldest outbound segment to the inflight set and put it on the
    /// wire, if the window allows.
    fn transmit_next(&self) -> Transmit {
        let mut out = self.outbound.lock();
        if self.is_destroyed() {
            return Transmit::Stopped;
        }
        if out.is_empty() {
            return Transmit::Empty;
        }
        let (seqno, len, wire) = {
            let mut inflight = self.inflight.lock();
            let Some(entry) = out.pop_sendable(&inflight, self.config.send_window) else {
                return Transmit::WindowFull;
            };
            let seqno = entry.seqno();
            let len = entry.payload_len();
            let wire = entry.wire.clone();
            inflight.insert(entry, Instant::now());
            (seqno, len, wire)
        };

        debug!(conn = self.id, seqno, len, "transmit");
        if let Err(e) = self.endpoint.send_bytes(&wire) {
            warn!(conn = self.id, seqno, error = %e, "send failed, leaving segment for retransmission");
        }
        Transmit::Sent
    }

    /// Process one datagram from the network.
    ///
    /// Segments that fail validation are returned as errors and are not
    /// acknowledged. Every other segment carrying data or a FIN is
    /// acknowledged, including duplicates and out-of-window segments.
    pub fn receive(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let segment = Segment::decode(bytes).map_err(|e| {
            debug!(conn = self.id, error = %e, "dropping invalid segment");
            e
        })?;
        trace!(
            conn = self.id,
            seqno = segment.seqno,
            ackno = segment.ackno,
            len = segment.payload.len(),
            flags = ?segment.flags,
            "received segment"
        );

        if segment.flags.contains(Flags::ACK) {
            self.process_ack(segment.ackno, segment.window)?;
        }
        if segment.is_pure_ack() || self.is_destroyed() {
            return Ok(());
        }

        let insert = {
            let mut received = self.received.lock();
            let insert = received.insert(&segment);
            self.mirror(&received);
            insert
        };
        match insert {
            Insert::Accepted => {}
            Insert::Duplicate => {
                debug!(conn = self.id, seqno = segment.seqno, "duplicate segment");
            }
            Insert::OutOfWindow => {
                debug!(conn = self.id, seqno = segment.seqno, "segment outside receive window");
            }
        }
        self.flush(true)
    }

    /// Retry delivery of buffered data after the application sink freed
    /// space. Sends a window update when anything was delivered.
    pub fn output(&self) -> Result<()> {
        self.ensure_live()?;
        self.flush(false)
    }

    fn flush(&self, always_ack: bool) -> Result<()> {
        let delivery = self.deliver();
        if delivery.bytes > 0 {
            trace!(conn = self.id, len = delivery.bytes, "delivered");
        }
        if always_ack || delivery.progressed() {
            self.send_ack();
        }
        if delivery.eof {
            debug!(conn = self.id, "peer finished sending");
            self.advance(Event::PeerFin)?;
        }
        Ok(())
    }

    fn deliver(&self) -> Delivery {
        let mut received = self.received.lock();
        if self.is_destroyed() {
            return Delivery::default();
        }
        let delivery = received.deliver(|data| self.endpoint.deliver_output(data));
        if delivery.eof {
            self.endpoint.finish_output();
        }
        self.mirror(&received);
        delivery
    }

    fn mirror(&self, received: &ReceiveBuffer) {
        self.last_ack_sent
            .store(received.last_ack_sent(), Ordering::Release);
        self.advertised_window
            .store(received.window(), Ordering::Release);
    }

    fn send_ack(&self) {
        let ackno = self.last_ack_sent();
        let window = self.advertised_window();
        let mut out = self.outbound.lock();
        if self.is_destroyed() {
            return;
        }
        out.set_window(window);
        let ack = out.ack(ackno);
        trace!(conn = self.id, ackno, window, "ack");
        if let Err(e) = self.endpoint.send_bytes(&ack.encode()) {
            warn!(conn = self.id, ackno, error = %e, "failed to send ack");
        }
    }

    fn process_ack(&self, ackno: u32, window: u16) -> Result<()> {
        let fin = self.fin_seqno();
        let (outcome, opened, last_ack_received) = {
            let mut inflight = self.inflight.lock();
            let outcome = inflight.acknowledge(ackno);
            let opened = inflight.update_window(ackno, window);
            (outcome, opened, inflight.last_ack_received())
        };
        if opened {
            trace!(conn = self.id, ackno, window, "peer window opened");
            self.window_open.notify_one();
        }

        match outcome {
            AckOutcome::Advanced { retired, freed } => {
                trace!(conn = self.id, ackno, retired, freed, "ack advanced");
                self.window_open.notify_one();
            }
            AckOutcome::Stale => return Ok(()),
            AckOutcome::Beyond => {
                debug!(conn = self.id, ackno, "ignoring ack for untransmitted data");
                return Ok(());
            }
        }

        if fin.is_some_and(|fin| last_ack_received > fin) {
            self.advance(Event::FinAcked)?;
        }
        Ok(())
    }

    fn advance(&self, event: Event) -> Result<ConnectionState> {
        let (from, to) = {
            let mut teardown = self.teardown.lock();
            let from = teardown.state;
            // Later acknowledgments keep covering the FIN.
            if event == Event::FinAcked && !from.awaiting_fin_ack() {
                return Ok(from);
            }
            let to = from.on(event)?;
            teardown.state = to;
            if to.is_closed() {
                teardown.closed_at = Some(Instant::now());
            }
            (from, to)
        };
        debug!(conn = self.id, %from, %to, %event, "state transition");

        if to.is_closed() && self.config.linger.is_zero() {
            self.destroy();
        }
        Ok(to)
    }

    /// Check inflight segments against their timeouts and resend or give up.
    /// Also destroys the connection once its linger period has elapsed.
    pub fn on_timer(&self, now: Instant) -> TimerOutcome {
        if self.is_destroyed() {
            return TimerOutcome::Idle;
        }

        let closed_at = self.teardown.lock().closed_at;
        if let Some(closed_at) = closed_at {
            if now.saturating_duration_since(closed_at) >= self.config.linger {
                self.destroy();
                return TimerOutcome::LingerExpired;
            }
        }

        let Some(mut inflight) = self.inflight.try_lock_for(TIMER_LOCK_WAIT) else {
            trace!(conn = self.id, "inflight busy, skipping sweep");
            return TimerOutcome::Skipped;
        };

        let expiry = inflight.expire(now, &self.config);
        match expiry {
            Expiry::Resend(wires) if wires.is_empty() => TimerOutcome::Idle,
            Expiry::Resend(wires) => {
                for wire in &wires {
                    if let Err(e) = self.endpoint.send_bytes(wire) {
                        warn!(conn = self.id, error = %e, "retransmission failed");
                    }
                }
                drop(inflight);
                debug!(conn = self.id, count = wires.len(), "retransmitted");
                TimerOutcome::Retransmitted(wires.len())
            }
            Expiry::Exhausted { seqno, retries } => {
                drop(inflight);
                self.abort(CtcpError::RetransmissionExhausted {
                    conn: self.id,
                    seqno,
                    retries,
                });
                TimerOutcome::Dead { seqno, retries }
            }
        }
    }

    /// Tear the connection down abnormally, notifying the application.
    pub fn abort(&self, reason: CtcpError) {
        if self.is_destroyed() {
            return;
        }
        warn!(conn = self.id, error = %reason, "connection reset");
        self.endpoint.connection_reset(&reason);
        self.destroy();
    }

    /// Stop the sender, deregister, drop queued segments and release the
    /// endpoint. Calling it again does nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.sender.lock().take() {
            task.abort();
        }
        self.sender_running.store(false, Ordering::Release);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }

        {
            let mut out = self.outbound.lock();
            let mut inflight = self.inflight.lock();
            out.clear();
            inflight.clear();
        }
        self.received.lock().clear();
        self.teardown.lock().state = ConnectionState::Closed;

        self.endpoint.release();
        info!(conn = self.id, "connection destroyed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(CtcpError::ConnectionClosed(self.id));
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
