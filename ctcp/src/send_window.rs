//! Sender-side bookkeeping: segments waiting for window space and segments
//! sent but not yet acknowledged.
//!
//! The [`OutboundQueue`] owns segment numbering and holds new segments in
//! creation order. The [`InflightSet`] holds transmitted segments keyed by
//! seqno together with the byte count they occupy in the send window, and
//! retires them as cumulative acknowledgments arrive.
//!
//! Transmission is bounded by the smaller of the local `send_window` and the
//! window the peer last advertised. While the peer's window is too small for
//! the next segment, one segment is still let through whenever nothing is in
//! flight, so a lost window update cannot stall the connection.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tokio::time::Instant;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::segment::{Segment, SegmentCodec, INITIAL_SEQ_NO};

/// A segment plus its encoded form and transmission history.
#[derive(Debug, Clone)]
pub struct TimestampedSegment {
    pub segment: Segment,
    /// Exact bytes put on the wire, reused for every retransmission.
    pub wire: Bytes,
    /// Time of the most recent transmission. `None` until first sent.
    pub send_time: Option<Instant>,
    pub retry_count: u32,
}

impl TimestampedSegment {
    pub fn new(segment: Segment) -> Self {
        let wire = segment.encode();
        Self {
            segment,
            wire,
            send_time: None,
            retry_count: 0,
        }
    }

    pub fn seqno(&self) -> u32 {
        self.segment.seqno
    }

    /// Payload bytes this segment counts against the send window.
    pub fn payload_len(&self) -> usize {
        self.segment.payload.len()
    }
}

/// Segments created but not yet transmitted.
#[derive(Debug)]
pub struct OutboundQueue {
    codec: SegmentCodec,
    queue: VecDeque<TimestampedSegment>,
}

impl OutboundQueue {
    pub fn new(window: u16, max_payload: usize) -> Self {
        Self {
            codec: SegmentCodec::new(window, max_payload),
            queue: VecDeque::new(),
        }
    }

    /// Number the payload and append it. Returns the assigned seqno.
    pub fn push_data(&mut self, payload: Bytes, ackno: u32) -> Result<u32> {
        let segment = self.codec.encode_data(payload, ackno)?;
        let seqno = segment.seqno;
        self.queue.push_back(TimestampedSegment::new(segment));
        Ok(seqno)
    }

    /// Append the connection's FIN. Returns its seqno.
    pub fn push_fin(&mut self, ackno: u32) -> Result<u32> {
        let segment = self.codec.encode_fin(ackno)?;
        let seqno = segment.seqno;
        self.queue.push_back(TimestampedSegment::new(segment));
        Ok(seqno)
    }

    /// Build a pure ACK numbered at the current send position.
    pub fn ack(&self, ackno: u32) -> Segment {
        self.codec.encode_ack(ackno)
    }

    /// Receive window carried by segments built from now on.
    pub fn set_window(&mut self, window: u16) {
        self.codec.set_window(window);
    }

    /// Remove the oldest segment if the window has room for it.
    pub fn pop_sendable(
        &mut self,
        inflight: &InflightSet,
        send_window: usize,
    ) -> Option<TimestampedSegment> {
        let front = self.queue.front()?;
        if !inflight.has_room(front.payload_len(), send_window) {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn next_seq_no(&self) -> u32 {
        self.codec.next_seq_no()
    }

    pub fn fin_seqno(&self) -> Option<u32> {
        self.codec.fin_seqno()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Result of applying a cumulative acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `last_ack_received` moved forward.
    Advanced { retired: usize, freed: usize },
    /// At or below `last_ack_received`.
    Stale,
    /// Acknowledges bytes that were never transmitted.
    Beyond,
}

/// Result of checking inflight segments against their timeouts.
#[derive(Debug, PartialEq, Eq)]
pub enum Expiry {
    /// Wire bytes of every segment due for a resend, in seqno order. The
    /// entries have already been restamped.
    Resend(Vec<Bytes>),
    /// A due segment has used up its retransmissions.
    Exhausted { seqno: u32, retries: u32 },
}

/// Segments transmitted and awaiting acknowledgment.
#[derive(Debug)]
pub struct InflightSet {
    entries: BTreeMap<u32, TimestampedSegment>,
    bytes_inflight: usize,
    last_ack_received: u32,
    /// One past the highest sequence number transmitted.
    snd_nxt: u32,
    /// Window most recently advertised by the peer.
    peer_window: usize,
}

impl InflightSet {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            bytes_inflight: 0,
            last_ack_received: INITIAL_SEQ_NO,
            snd_nxt: INITIAL_SEQ_NO,
            peer_window: usize::from(u16::MAX),
        }
    }

    /// Whether a segment of `payload_len` bytes may be transmitted now.
    pub fn has_room(&self, payload_len: usize, send_window: usize) -> bool {
        if payload_len == 0 {
            return true;
        }
        if self.bytes_inflight + payload_len <= send_window.min(self.peer_window) {
            return true;
        }
        self.entries.is_empty() && payload_len <= send_window
    }

    /// Record `entry` as transmitted at `now`. Returns `false` and leaves the
    /// set unchanged if its seqno is already inflight.
    pub fn insert(&mut self, mut entry: TimestampedSegment, now: Instant) -> bool {
        let seqno = entry.seqno();
        if self.entries.contains_key(&seqno) {
            return false;
        }
        entry.send_time = Some(now);
        self.bytes_inflight += entry.payload_len();
        self.snd_nxt = self.snd_nxt.max(entry.segment.seq_end());
        self.entries.insert(seqno, entry);
        true
    }

    /// Apply a cumulative acknowledgment, retiring every entry that ends at or
    /// before `ackno`.
    pub fn acknowledge(&mut self, ackno: u32) -> AckOutcome {
        if ackno > self.snd_nxt {
            return AckOutcome::Beyond;
        }
        if ackno <= self.last_ack_received {
            return AckOutcome::Stale;
        }
        self.last_ack_received = ackno;

        let mut retired = 0;
        let mut freed = 0;
        while let Some(first) = self.entries.first_entry() {
            let entry = first.get();
            if entry.seqno() + entry.segment.seq_len() > ackno {
                break;
            }
            freed += entry.payload_len();
            retired += 1;
            first.remove();
        }
        self.bytes_inflight -= freed;
        AckOutcome::Advanced { retired, freed }
    }

    /// Record the window advertised with `ackno`. Call after
    /// [`acknowledge`](Self::acknowledge). Returns `true` if the window grew.
    ///
    /// Acknowledgments older than `last_ack_received` or beyond `snd_nxt` are
    /// ignored. When the oldest inflight segment is partly acknowledged, or
    /// the peer reports no room for the rest of it, its retry count starts
    /// over: the peer is alive and flow control is what holds it back.
    pub fn update_window(&mut self, ackno: u32, window: u16) -> bool {
        if ackno < self.last_ack_received || ackno > self.snd_nxt {
            return false;
        }
        let window = usize::from(window);
        let opened = window > self.peer_window;
        self.peer_window = window;

        if let Some(mut oldest) = self.entries.first_entry() {
            let entry = oldest.get_mut();
            let unacked = entry.segment.seq_end().saturating_sub(ackno.max(entry.seqno()));
            if ackno > entry.seqno() || unacked as usize > window {
                entry.retry_count = 0;
            }
        }
        opened
    }

    /// Restamp and collect every entry older than its timeout.
    ///
    /// An entry that is due after `max_retransmissions` resends ends the
    /// sweep with [`Expiry::Exhausted`].
    pub fn expire(&mut self, now: Instant, config: &ConnectionConfig) -> Expiry {
        let mut resend = Vec::new();
        for entry in self.entries.values_mut() {
            let Some(sent) = entry.send_time else {
                continue;
            };
            if now.saturating_duration_since(sent) <= config.timeout_for(entry.retry_count) {
                continue;
            }
            if entry.retry_count >= config.max_retransmissions {
                return Expiry::Exhausted {
                    seqno: entry.seqno(),
                    retries: entry.retry_count,
                };
            }
            entry.send_time = Some(now);
            entry.retry_count += 1;
            resend.push(entry.wire.clone());
        }
        Expiry::Resend(resend)
    }

    pub fn get(&self, seqno: u32) -> Option<&TimestampedSegment> {
        self.entries.get(&seqno)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimestampedSegment> {
        self.entries.values()
    }

    pub fn bytes_inflight(&self) -> usize {
        self.bytes_inflight
    }

    pub fn last_ack_received(&self) -> u32 {
        self.last_ack_received
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn peer_window(&self) -> usize {
        self.peer_window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes_inflight = 0;
    }
}

impl Default for InflightSet {
    fn default() -> Self {
        Self::new()
    }
}
