use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum::checksum;
use crate::error::{CtcpError, Result};

/// Size of the fixed segment header on the wire.
pub const HEADER_LEN: usize = 18;

/// Largest payload a single segment can carry (the `len` field is 16 bits).
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

/// First sequence number used by every connection.
pub const INITIAL_SEQ_NO: u32 = 1;

const OFF_CHECKSUM: usize = 16;

/// Control flags carried in the 32-bit `flags` field.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(pub u32);

impl Flags {
    pub const NONE: Self = Self(0);
    pub const ACK: Self = Self(1 << 0);
    pub const SYN: Self = Self(1 << 1);
    pub const FIN: Self = Self(1 << 2);

    pub fn contains(self, flag: Flags) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Flags::ACK) {
            names.push("ACK");
        }
        if self.contains(Flags::SYN) {
            names.push("SYN");
        }
        if self.contains(Flags::FIN) {
            names.push("FIN");
        }
        write!(f, "Flags({})", names.join("|"))
    }
}

/// A cTCP segment.
///
/// Binary layout (all fields big-endian):
///
/// ```text
/// +--------+--------+-----+--------+--------+----------+---------------+
/// | seqno  | ackno  | len | flags  | window | checksum | payload ...   |
/// |  (4B)  |  (4B)  | (2B)|  (4B)  |  (2B)  |   (2B)   | (len - 18 B)  |
/// +--------+--------+-----+--------+--------+----------+---------------+
/// ```
///
/// `len` counts the header and the payload. The checksum covers the whole
/// segment with the checksum field treated as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seqno: u32,
    pub ackno: u32,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub payload: Bytes,
}

impl Segment {
    /// Build a segment and compute its checksum.
    ///
    /// Fails with [`CtcpError::PayloadTooLarge`] when the payload does not fit
    /// the 16-bit `len` field.
    pub fn new(seqno: u32, ackno: u32, flags: Flags, window: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CtcpError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self::build(seqno, ackno, flags, window, payload))
    }

    /// `payload` must be at most [`MAX_PAYLOAD`] bytes.
    fn build(seqno: u32, ackno: u32, flags: Flags, window: u16, payload: Bytes) -> Self {
        let mut segment = Self {
            seqno,
            ackno,
            flags,
            window,
            checksum: 0,
            payload,
        };
        segment.checksum = segment.compute_checksum();
        segment
    }

    /// Value of the `len` header field.
    pub fn len(&self) -> u16 {
        (HEADER_LEN + self.payload.len()) as u16
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(Flags::FIN)
    }

    /// A segment that carries neither payload nor FIN.
    pub fn is_pure_ack(&self) -> bool {
        self.payload.is_empty() && !self.is_fin()
    }

    /// Sequence space consumed by this segment: the payload length, plus one
    /// for a FIN.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.is_fin())
    }

    /// First sequence number after this segment.
    pub fn seq_end(&self) -> u32 {
        self.seqno.wrapping_add(self.seq_len())
    }

    /// Checksum over the encoded segment with the checksum field zeroed.
    pub fn compute_checksum(&self) -> u16 {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.put_fields(&mut buf, 0);
        checksum(&buf)
    }

    /// Encode this segment, carrying its stored checksum.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        self.put_fields(buf, self.checksum);
    }

    /// The total number of bytes this segment occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    fn put_fields(&self, buf: &mut BytesMut, checksum: u16) {
        buf.put_u32(self.seqno);
        buf.put_u32(self.ackno);
        buf.put_u16(self.len());
        buf.put_u32(self.flags.0);
        buf.put_u16(self.window);
        buf.put_u16(checksum);
        buf.put_slice(&self.payload);
    }

    /// Decode and validate a segment.
    ///
    /// Bytes beyond the declared `len` are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(CtcpError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut header = &data[..HEADER_LEN];
        let seqno = header.get_u32();
        let ackno = header.get_u32();
        let len = header.get_u16();
        let flags = Flags(header.get_u32());
        let window = header.get_u16();
        let carried = header.get_u16();

        let total = len as usize;
        if total < HEADER_LEN {
            return Err(CtcpError::MalformedLength(len));
        }
        if total > data.len() {
            return Err(CtcpError::Truncated {
                expected: total,
                actual: data.len(),
            });
        }

        let mut scratch = data[..total].to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        let computed = checksum(&scratch);
        if computed != carried {
            return Err(CtcpError::ChecksumMismatch { carried, computed });
        }

        Ok(Segment {
            seqno,
            ackno,
            flags,
            window,
            checksum: carried,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..total]),
        })
    }
}

/// Sender-side segment construction for one connection.
///
/// Owns the numbering state: the next sequence number to assign and the
/// position of the FIN once it has been created.
#[derive(Debug)]
pub struct SegmentCodec {
    next_seq_no: u32,
    fin_seqno: Option<u32>,
    window: u16,
    max_payload: usize,
}

impl SegmentCodec {
    pub fn new(window: u16, max_payload: usize) -> Self {
        Self {
            next_seq_no: INITIAL_SEQ_NO,
            fin_seqno: None,
            window,
            max_payload: max_payload.min(MAX_PAYLOAD),
        }
    }

    pub fn next_seq_no(&self) -> u32 {
        self.next_seq_no
    }

    /// Sequence number of the FIN, if it has been created.
    pub fn fin_seqno(&self) -> Option<u32> {
        self.fin_seqno
    }

    /// Build a data segment for `payload`, advancing `next_seq_no` by its
    /// length.
    pub fn encode_data(&mut self, payload: Bytes, ackno: u32) -> Result<Segment> {
        if self.fin_seqno.is_some() {
            return Err(CtcpError::FinAlreadySent);
        }
        if payload.len() > self.max_payload {
            return Err(CtcpError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let next = self
            .next_seq_no
            .checked_add(payload.len() as u32)
            .ok_or(CtcpError::SequenceSpaceExhausted)?;
        let segment = Segment::build(self.next_seq_no, ackno, Flags::ACK, self.window, payload);
        self.next_seq_no = next;
        Ok(segment)
    }

    /// Build the connection's single FIN segment. It consumes one sequence
    /// number.
    pub fn encode_fin(&mut self, ackno: u32) -> Result<Segment> {
        if self.fin_seqno.is_some() {
            return Err(CtcpError::FinAlreadySent);
        }
        let next = self
            .next_seq_no
            .checked_add(1)
            .ok_or(CtcpError::SequenceSpaceExhausted)?;
        let segment = Segment::build(
            self.next_seq_no,
            ackno,
            Flags::ACK | Flags::FIN,
            self.window,
            Bytes::new(),
        );
        self.fin_seqno = Some(self.next_seq_no);
        self.next_seq_no = next;
        Ok(segment)
    }

    /// Build a pure acknowledgment.
    pub fn encode_ack(&self, ackno: u32) -> Segment {
        Segment::build(self.next_seq_no, ackno, Flags::ACK, self.window, Bytes::new())
    }

    /// Receive window advertised by segments built from now on.
    pub fn set_window(&mut self, window: u16) {
        self.window = window;
    }

    pub fn decode(data: &[u8]) -> Result<Segment> {
        Segment::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let seg = Segment::new(
            0x0102_0304,
            0x0506_0708,
            Flags::ACK | Flags::FIN,
            0x0a0b,
            Bytes::from_static(b"xy"),
        )
        .unwrap();
        let wire = seg.encode();
        assert_eq!(wire.len(), HEADER_LEN + 2);
        assert_eq!(&wire[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&wire[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&wire[8..10], &[0x00, 20]);
        assert_eq!(&wire[10..14], &[0x00, 0x00, 0x00, 0x05]);
        assert_eq!(&wire[14..16], &[0x0a, 0x0b]);
        assert_eq!(&wire[18..], b"xy");
    }

    #[test]
    fn checksum_of_encoded_segment_folds_to_zero() {
        let seg = Segment::new(7, 9, Flags::ACK, 1440, Bytes::from_static(b"payload")).unwrap();
        assert_eq!(checksum(&seg.encode()), 0);
    }

    #[test]
    fn decode_rejects_short_header() {
        let err = Segment::decode(&[0u8; HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, CtcpError::Truncated { expected: HEADER_LEN, .. }));
    }

    #[test]
    fn decode_rejects_len_below_header() {
        let mut wire = Segment::new(1, 1, Flags::ACK, 0, Bytes::new())
            .unwrap()
            .encode()
            .to_vec();
        wire[8..10].copy_from_slice(&5u16.to_be_bytes());
        assert!(matches!(
            Segment::decode(&wire),
            Err(CtcpError::MalformedLength(5))
        ));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let wire = Segment::new(1, 1, Flags::ACK, 0, Bytes::from_static(b"abcd"))
            .unwrap()
            .encode();
        let err = Segment::decode(&wire[..wire.len() - 1]).unwrap_err();
        assert!(matches!(err, CtcpError::Truncated { .. }));
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let seg = Segment::new(1, 1, Flags::ACK, 0, Bytes::from_static(b"abcd")).unwrap();
        let mut wire = seg.encode().to_vec();
        wire.extend_from_slice(b"junk");
        assert_eq!(Segment::decode(&wire).unwrap(), seg);
    }

    #[test]
    fn codec_numbers_data_then_fin() {
        let mut codec = SegmentCodec::new(1440, 1440);
        let a = codec.encode_data(Bytes::from_static(b"hello"), 1).unwrap();
        let b = codec.encode_data(Bytes::from_static(b"world!"), 1).unwrap();
        assert_eq!(a.seqno, INITIAL_SEQ_NO);
        assert_eq!(b.seqno, INITIAL_SEQ_NO + 5);
        assert_eq!(codec.next_seq_no(), INITIAL_SEQ_NO + 11);

        let fin = codec.encode_fin(1).unwrap();
        assert!(fin.is_fin());
        assert!(fin.flags.contains(Flags::ACK));
        assert_eq!(fin.seqno, INITIAL_SEQ_NO + 11);
        assert_eq!(fin.seq_len(), 1);
        assert_eq!(codec.next_seq_no(), INITIAL_SEQ_NO + 12);
        assert_eq!(codec.fin_seqno(), Some(INITIAL_SEQ_NO + 11));
    }

    #[test]
    fn codec_creates_only_one_fin() {
        let mut codec = SegmentCodec::new(1440, 1440);
        codec.encode_fin(1).unwrap();
        assert!(matches!(codec.encode_fin(1), Err(CtcpError::FinAlreadySent)));
        assert!(matches!(
            codec.encode_data(Bytes::from_static(b"late"), 1),
            Err(CtcpError::FinAlreadySent)
        ));
    }

    #[test]
    fn codec_rejects_oversized_payload() {
        let mut codec = SegmentCodec::new(1440, 4);
        let err = codec.encode_data(Bytes::from_static(b"12345"), 1).unwrap_err();
        assert!(matches!(err, CtcpError::PayloadTooLarge { size: 5, max: 4 }));
        assert_eq!(codec.next_seq_no(), INITIAL_SEQ_NO);
    }

    #[test]
    fn codec_reports_sequence_exhaustion() {
        let mut codec = SegmentCodec::new(1440, 1440);
        codec.next_seq_no = u32::MAX - 2;
        let err = codec.encode_data(Bytes::from_static(b"abc"), 1).unwrap_err();
        assert!(matches!(err, CtcpError::SequenceSpaceExhausted));
    }

    #[test]
    fn ack_carries_window_and_no_payload() {
        let codec = SegmentCodec::new(2880, 1440);
        let ack = codec.encode_ack(42);
        assert!(ack.is_pure_ack());
        assert_eq!(ack.ackno, 42);
        assert_eq!(ack.window, 2880);
        assert_eq!(ack.len() as usize, HEADER_LEN);
    }

    #[test]
    fn new_rejects_payload_beyond_len_field() {
        let payload = Bytes::from(vec![0u8; MAX_PAYLOAD + 1]);
        let err = Segment::new(1, 1, Flags::ACK, 1440, payload).unwrap_err();
        assert!(matches!(
            err,
            CtcpError::PayloadTooLarge { size, max: MAX_PAYLOAD } if size == MAX_PAYLOAD + 1
        ));

        let largest = Segment::new(1, 1, Flags::ACK, 1440, Bytes::from(vec![0u8; MAX_PAYLOAD]))
            .unwrap();
        assert_eq!(largest.len(), u16::MAX);
    }

    #[test]
    fn window_update_applies_to_later_segments() {
        let mut codec = SegmentCodec::new(1440, 1440);
        let before = codec.encode_data(Bytes::from_static(b"a"), 1).unwrap();
        codec.set_window(0);
        let after = codec.encode_data(Bytes::from_static(b"b"), 1).unwrap();
        assert_eq!(before.window, 1440);
        assert_eq!(after.window, 0);
        assert_eq!(codec.encode_ack(1).window, 0);
    }
}
