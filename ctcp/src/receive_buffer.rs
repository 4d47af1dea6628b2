//! Resequencing of incoming data.
//!
//! Segments are held in a `BTreeMap` keyed by the first sequence number they
//! still need to deliver. Contiguous bytes are acknowledged as soon as they
//! are buffered; delivery then hands them to a sink that may accept only part
//! of them. The receive window spans `recv_window` bytes from the first byte
//! not yet taken by the sink, so a stalled sink closes the window instead of
//! holding back acknowledgments.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use bytes::Bytes;

use crate::segment::{Segment, INITIAL_SEQ_NO};

/// What happened to an inserted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// New data or a new FIN was stored.
    Accepted,
    /// Everything in the segment was already received.
    Duplicate,
    /// The segment starts at or beyond the receive window.
    OutOfWindow,
}

/// Result of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Bytes accepted by the sink.
    pub bytes: usize,
    /// The end of the peer's stream was reached during this pass.
    pub eof: bool,
    /// The sink refused some bytes; they remain buffered.
    pub blocked: bool,
}

impl Delivery {
    pub fn progressed(&self) -> bool {
        self.bytes > 0 || self.eof
    }
}

#[derive(Debug)]
pub struct ReceiveBuffer {
    pending: BTreeMap<u32, Bytes>,
    /// Next sequence number expected from the peer.
    last_ack_sent: u32,
    /// Next sequence number to hand to the sink.
    delivered: u32,
    /// Sequence number occupied by the peer's FIN.
    fin_seqno: Option<u32>,
    eof_delivered: bool,
    recv_window: usize,
}

impl ReceiveBuffer {
    pub fn new(recv_window: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            last_ack_sent: INITIAL_SEQ_NO,
            delivered: INITIAL_SEQ_NO,
            fin_seqno: None,
            eof_delivered: false,
            recv_window,
        }
    }

    /// One past the last sequence number the buffer has room for.
    fn window_end(&self) -> u64 {
        (u64::from(self.delivered) + self.recv_window as u64).min(u64::from(u32::MAX))
    }

    /// Store the data and FIN of `segment` and acknowledge whatever became
    /// contiguous.
    ///
    /// Payload beyond the window is cut off, and so is a FIN that would sit
    /// past it. A bare FIN exactly at the window edge takes no buffer space
    /// and is accepted.
    pub fn insert(&mut self, segment: &Segment) -> Insert {
        let window_end = self.window_end();
        let seqno = u64::from(segment.seqno);
        if seqno > window_end || (seqno == window_end && !segment.payload.is_empty()) {
            return Insert::OutOfWindow;
        }

        let mut accepted = false;
        let payload_end = seqno + segment.payload.len() as u64;

        if segment.is_fin() && self.fin_seqno.is_none() && payload_end <= window_end {
            let fin = payload_end as u32;
            if fin >= self.last_ack_sent {
                self.fin_seqno = Some(fin);
                accepted = true;
            }
        }

        let limit = match self.fin_seqno {
            Some(fin) => window_end.min(u64::from(fin)),
            None => window_end,
        };
        let end = payload_end.min(limit) as u32;
        if end > self.last_ack_sent && end > segment.seqno {
            let start = segment.seqno.max(self.last_ack_sent);
            let skip = (start - segment.seqno) as usize;
            let take = (end - segment.seqno) as usize;
            let data = segment.payload.slice(skip..take);
            match self.pending.entry(start) {
                Entry::Vacant(slot) => {
                    slot.insert(data);
                    accepted = true;
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().len() < data.len() {
                        slot.insert(data);
                        accepted = true;
                    }
                }
            }
        }

        if accepted {
            self.advance();
            Insert::Accepted
        } else {
            Insert::Duplicate
        }
    }

    /// Move `last_ack_sent` over every buffered byte contiguous with it, and
    /// over the FIN once all data before it is present.
    fn advance(&mut self) {
        loop {
            let reach = self
                .pending
                .range(..=self.last_ack_sent)
                .map(|(&key, data)| key + data.len() as u32)
                .max();
            match reach {
                Some(end) if end > self.last_ack_sent => self.last_ack_sent = end,
                _ => break,
            }
        }
        if self.fin_seqno == Some(self.last_ack_sent) {
            self.last_ack_sent = self.last_ack_sent.saturating_add(1);
        }
    }

    /// Offer contiguous bytes to `sink`, which returns how many it took.
    ///
    /// Refused bytes stay buffered. When delivery reaches the peer's FIN,
    /// `eof` is reported once.
    pub fn deliver<F>(&mut self, mut sink: F) -> Delivery
    where
        F: FnMut(&[u8]) -> usize,
    {
        let mut delivery = Delivery::default();

        while let Some(first) = self.pending.first_entry() {
            let key = *first.key();
            if key > self.delivered {
                break;
            }
            let mut data = first.remove();
            let skip = (self.delivered - key) as usize;
            if skip >= data.len() {
                continue;
            }
            data = data.slice(skip..);

            let taken = sink(&data).min(data.len());
            self.delivered += taken as u32;
            delivery.bytes += taken;
            if taken < data.len() {
                self.pending
                    .entry(self.delivered)
                    .or_insert_with(|| data.slice(taken..));
                delivery.blocked = true;
                return delivery;
            }
        }

        if !self.eof_delivered && self.fin_seqno == Some(self.delivered) {
            self.eof_delivered = true;
            self.delivered = self.delivered.saturating_add(1);
            delivery.eof = true;
        }
        delivery
    }

    pub fn last_ack_sent(&self) -> u32 {
        self.last_ack_sent
    }

    /// Next sequence number the sink has not taken.
    pub fn delivered(&self) -> u32 {
        self.delivered
    }

    /// Free space from `last_ack_sent` to the end of the window, as carried
    /// in the header.
    pub fn window(&self) -> u16 {
        let free = self
            .window_end()
            .saturating_sub(u64::from(self.last_ack_sent));
        free.min(u64::from(u16::MAX)) as u16
    }

    pub fn fin_seqno(&self) -> Option<u32> {
        self.fin_seqno
    }

    pub fn eof_delivered(&self) -> bool {
        self.eof_delivered
    }

    /// Bytes held for delivery, including overlapping copies.
    pub fn buffered(&self) -> usize {
        self.pending.values().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
