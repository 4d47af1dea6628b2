//! Send-window accounting: window gating, in-flight byte counts and
//! cumulative acknowledgment handling.

use std::sync::Arc;

use bytes::Bytes;
use ctcp::segment::INITIAL_SEQ_NO;
use ctcp::sim::MemoryEndpoint;
use ctcp::{Connection, ConnectionConfig, Flags, Registry, Segment};

fn windowed(send_window: usize, max_segment_payload: usize) -> ConnectionConfig {
    ConnectionConfig {
        recv_window: 4000,
        send_window,
        max_segment_payload,
        ..ConnectionConfig::default()
    }
}

fn open(registry: &Registry, config: ConnectionConfig) -> (Arc<MemoryEndpoint>, Arc<Connection>) {
    let endpoint = Arc::new(MemoryEndpoint::new());
    let conn = registry.create(endpoint.clone(), config).unwrap();
    (endpoint, conn)
}

fn ack(ackno: u32) -> Bytes {
    Segment::new(1, ackno, Flags::ACK, 4000, Bytes::new())
        .unwrap()
        .encode()
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn assert_accounting(conn: &Connection) {
    let stats = conn.stats();
    assert_eq!(stats.bytes_inflight, stats.inflight_payload);
}

fn decode_all(wire: &[Bytes]) -> Vec<Segment> {
    wire.iter().map(|b| Segment::decode(b).unwrap()).collect()
}

// ---------------------------------------------------------------------------
// Window gating
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn two_segments_fill_a_2000_byte_window() {
    let registry = Registry::new();
    let (endpoint, conn) = open(&registry, windowed(2000, 1000));

    endpoint.write_input(&[7u8; 3000]);
    conn.read().unwrap();
    settle().await;

    let sent = decode_all(&endpoint.take_wire());
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].seqno, INITIAL_SEQ_NO);
    assert_eq!(sent[1].seqno, INITIAL_SEQ_NO + 1000);
    let stats = conn.stats();
    assert_eq!(stats.inflight_segments, 2);
    assert_eq!(stats.bytes_inflight, 2000);
    assert_eq!(stats.outbound_segments, 1);

    conn.receive(&ack(INITIAL_SEQ_NO + 1000)).unwrap();
    settle().await;

    let sent = decode_all(&endpoint.take_wire());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seqno, INITIAL_SEQ_NO + 2000);
    assert_eq!(sent[0].payload.len(), 1000);
    assert_eq!(conn.bytes_inflight(), 2000);
    assert_eq!(conn.stats().outbound_segments, 0);
}

#[tokio::test(start_paused = true)]
async fn transmissions_stay_within_the_window() {
    let registry = Registry::new();
    let config = windowed(1500, 500);
    let send_window = config.send_window as u32;
    let (endpoint, conn) = open(&registry, config);

    endpoint.write_input(&[1u8; 5000]);
    conn.read().unwrap();
    settle().await;

    let mut acked = INITIAL_SEQ_NO;
    let mut total = 0;
    while total < 5000 {
        let last_ack_received = conn.last_ack_received();
        let sent = decode_all(&endpoint.take_wire());
        assert!(!sent.is_empty());
        for seg in &sent {
            assert!(seg.seqno + seg.payload.len() as u32 <= last_ack_received + send_window);
            total += seg.payload.len();
        }
        // Acknowledge one segment at a time.
        acked += 500;
        conn.receive(&ack(acked)).unwrap();
        settle().await;
    }
    assert_eq!(total, 5000);
}

#[tokio::test(start_paused = true)]
async fn bytes_inflight_tracks_entries() {
    let registry = Registry::new();
    let (endpoint, conn) = open(&registry, windowed(4000, 700));

    endpoint.write_input(&[3u8; 3000]);
    conn.read().unwrap();
    settle().await;

    assert_accounting(&conn);
    assert_eq!(conn.bytes_inflight(), 3000);

    for ackno in [INITIAL_SEQ_NO + 700, INITIAL_SEQ_NO + 1000, INITIAL_SEQ_NO + 2100] {
        conn.receive(&ack(ackno)).unwrap();
        assert_accounting(&conn);
    }
    assert_eq!(conn.bytes_inflight(), 900);
}

// ---------------------------------------------------------------------------
// Acknowledgment handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_acks_never_move_backwards() {
    let registry = Registry::new();
    let (endpoint, conn) = open(&registry, windowed(4000, 1000));

    endpoint.write_input(&[9u8; 2000]);
    conn.read().unwrap();
    settle().await;

    conn.receive(&ack(INITIAL_SEQ_NO + 1500)).unwrap();
    let after = conn.stats();
    assert_eq!(after.last_ack_received, INITIAL_SEQ_NO + 1500);

    conn.receive(&ack(INITIAL_SEQ_NO + 1000)).unwrap();
    conn.receive(&ack(INITIAL_SEQ_NO)).unwrap();
    conn.receive(&ack(INITIAL_SEQ_NO + 1500)).unwrap();
    assert_eq!(conn.stats(), after);
}

#[tokio::test(start_paused = true)]
async fn ack_for_untransmitted_data_is_ignored() {
    let registry = Registry::new();
    let (endpoint, conn) = open(&registry, windowed(1000, 1000));

    endpoint.write_input(&[5u8; 2000]);
    conn.read().unwrap();
    settle().await;
    assert_eq!(endpoint.take_wire().len(), 1);

    // Covers the queued second segment, which was never sent.
    conn.receive(&ack(INITIAL_SEQ_NO + 2000)).unwrap();
    assert_eq!(conn.last_ack_received(), INITIAL_SEQ_NO);
    assert_eq!(conn.bytes_inflight(), 1000);
}

#[tokio::test(start_paused = true)]
async fn acks_ride_on_data_segments() {
    let registry = Registry::new();
    let (endpoint, conn) = open(&registry, windowed(1000, 1000));

    endpoint.write_input(b"question");
    conn.read().unwrap();
    settle().await;
    endpoint.take_wire();

    let reply = Segment::new(
        INITIAL_SEQ_NO,
        INITIAL_SEQ_NO + 8,
        Flags::ACK,
        4000,
        Bytes::from_static(b"answer"),
    )
    .unwrap();
    conn.receive(&reply.encode()).unwrap();

    assert_eq!(conn.bytes_inflight(), 0);
    assert_eq!(conn.last_ack_received(), INITIAL_SEQ_NO + 8);
    assert_eq!(endpoint.output(), b"answer");

    let acks = decode_all(&endpoint.take_wire());
    assert_eq!(acks.len(), 1);
    assert!(acks[0].is_pure_ack());
    assert_eq!(acks[0].ackno, INITIAL_SEQ_NO + 6);
    assert_eq!(acks[0].seqno, INITIAL_SEQ_NO + 8);
}
