//! End-to-end TCP tests against a frame-capturing NIC.
//!
//! The harness registers one interface per test (its own /24), seeds the
//! ARP cache so transmission is immediate, and parses every frame the
//! stack emits back into segments. Peer behavior is simulated by
//! injecting hand-built segments into the input path. Tests serialize on
//! one mutex because the 250 ms timer tick walks the global socket list.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::Errno;
use crate::net::device::{self, NetDevice, NetDriver};
use crate::net::ip::Ipv4Packet;
use crate::net::types::{Ipv4Addr, MacAddr};
use crate::net::{arp, ip};
use crate::sync::Spinlock;

use super::input::{self, Segment};
use super::output::{self, ACK, FIN, PSH, RST, SYN};
use super::sock::{Socket, TcpState, DEFAULT_MSS, MSL, RTO_INIT};
use super::{accept, close, connect, listen, recv, send, snapshot, status, timer};

static TCP_TESTS: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn serialize() -> std::sync::MutexGuard<'static, ()> {
    TCP_TESTS.lock().unwrap_or_else(|e| e.into_inner())
}

struct CaptureNic {
    frames: Spinlock<Vec<Vec<u8>>>,
}

impl NetDriver for CaptureNic {
    fn transmit(&self, frame: &[u8]) -> Result<(), Errno> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }
}

struct Harness {
    nic: &'static CaptureNic,
    local: Ipv4Addr,
    peer: Ipv4Addr,
    #[allow(dead_code)]
    dev: &'static NetDevice,
}

impl Harness {
    /// One isolated /24 per test.
    fn new(net: u8) -> Harness {
        let local = Ipv4Addr::new(10, 99, net, 2);
        let peer = Ipv4Addr::new(10, 99, net, 9);
        let nic: &'static CaptureNic =
            Box::leak(Box::new(CaptureNic { frames: Spinlock::new(Vec::new()) }));
        let dev = device::register(
            MacAddr([0x52, 0x54, 0, 99, net, 2]),
            local,
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::ZERO,
            1500,
            nic,
        );
        arp::insert(peer, MacAddr([0x52, 0x54, 0, 99, net, 9]));
        Harness { nic, local, peer, dev }
    }

    /// Drain and parse every segment the stack has emitted.
    fn sent(&self) -> Vec<Segment> {
        let frames: Vec<Vec<u8>> = core::mem::take(&mut *self.nic.frames.lock());
        frames
            .iter()
            .filter_map(|frame| {
                let pkt = ip::parse(&frame[14..])?;
                if pkt.protocol != ip::PROTO_TCP {
                    return None;
                }
                input::parse_tcp(&pkt)
            })
            .collect()
    }

    /// Inject one segment from the peer.
    #[allow(clippy::too_many_arguments)]
    fn inject(
        &self,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        mss: Option<u16>,
        payload: &[u8],
    ) {
        let seg = output::build_segment(
            self.peer, self.local, src_port, dst_port, seq, ack, flags, window, mss, payload,
        );
        let pkt = Ipv4Packet {
            src: self.peer,
            dst: self.local,
            protocol: ip::PROTO_TCP,
            ttl: 64,
            payload: &seg,
        };
        input::handle_segment(&pkt);
    }
}

/// Drive a client through the three-way handshake. Returns the socket,
/// its local port, the peer's port, and the peer's initial sequence.
fn established(h: &Harness, peer_port: u16, peer_window: u16) -> (Arc<Socket>, u16, u32) {
    let sock = connect(h.peer, peer_port).unwrap();
    let syns = h.sent();
    assert_eq!(syns.len(), 1);
    let syn = &syns[0];
    assert_eq!(syn.flags, SYN);
    assert_eq!(syn.mss, Some(DEFAULT_MSS));
    let local_port = syn.src_port;
    let iss = syn.seq;

    let peer_iss = 90_000u32;
    h.inject(
        peer_port,
        local_port,
        peer_iss,
        iss.wrapping_add(1),
        SYN | ACK,
        peer_window,
        Some(DEFAULT_MSS),
        &[],
    );
    assert_eq!(status(&sock), TcpState::Established);

    let acks = h.sent();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].flags, ACK);
    assert_eq!(acks[0].ack, peer_iss.wrapping_add(1));

    (sock, local_port, peer_iss.wrapping_add(1))
}

#[test]
fn active_open_and_data_round_trip() {
    let _guard = serialize();
    let h = Harness::new(1);
    let (sock, local_port, peer_seq) = established(&h, 8080, 16384);

    // Send a small burst: nothing in flight, it fits, one segment.
    assert_eq!(send(&sock, b"hello kernel tcp").unwrap(), 16);
    let out = h.sent();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].payload, b"hello kernel tcp");
    assert_eq!(out[0].flags & PSH, PSH);
    let data_seq = out[0].seq;

    // The peer ACKs and delivers a reply in order.
    h.inject(8080, local_port, peer_seq, data_seq.wrapping_add(16), ACK, 16384, None, &[]);
    h.inject(8080, local_port, peer_seq, data_seq.wrapping_add(16), ACK | PSH, 16384, None, b"pong");

    let mut buf = [0u8; 32];
    assert_eq!(recv(&sock, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"pong");

    close(&sock);
    let fin = h.sent();
    assert!(fin.iter().any(|s| s.flags & FIN != 0));
    // Tear the rest down with a RST so the table stays clean.
    let fin_seg = fin.iter().find(|s| s.flags & FIN != 0).unwrap();
    h.inject(8080, local_port, peer_seq.wrapping_add(4), fin_seg.seq.wrapping_add(1), RST, 0, None, &[]);
}

#[test]
fn passive_open_through_accept() {
    let _guard = serialize();
    let h = Harness::new(2);
    let listener = listen(Ipv4Addr::ZERO, 7070, 4).unwrap();

    // SYN arrives: a SYN-ACK goes out, the child sits in the backlog.
    h.inject(41000, 7070, 5000, 0, SYN, 8192, Some(1200), &[]);
    let synack = h.sent();
    assert_eq!(synack.len(), 1);
    assert_eq!(synack[0].flags, SYN | ACK);
    assert_eq!(synack[0].ack, 5001);
    let child_iss = synack[0].seq;

    // Not established yet: accept has nothing.
    assert!(accept(&listener).unwrap().is_none());

    // The handshake ACK completes it.
    h.inject(41000, 7070, 5001, child_iss.wrapping_add(1), ACK, 8192, None, &[]);
    let (child, peer_ip, peer_port) = accept(&listener).unwrap().unwrap();
    assert_eq!(peer_ip, h.peer);
    assert_eq!(peer_port, 41000);
    assert_eq!(status(&child), TcpState::Established);
    // The child MSS honors the peer's announcement.
    assert_eq!(child.inner.lock().smss, 1200);

    h.inject(41000, 7070, 5001, child_iss.wrapping_add(1), RST, 0, None, &[]);
    close(&listener);
}

#[test]
fn fast_retransmit_on_three_duplicate_acks() {
    let _guard = serialize();
    let h = Harness::new(3);
    let (sock, local_port, peer_seq) = established(&h, 8081, 65535);

    let mss = DEFAULT_MSS as u32;
    // Pretend the window is fully open for ten segments.
    sock.inner.lock().cwnd = 10 * mss;

    let data = std::vec![0x42u8; 5 * mss as usize];
    assert_eq!(send(&sock, &data).unwrap(), data.len());
    let sent = h.sent();
    assert_eq!(sent.len(), 5, "five full-MSS segments leave back to back");
    let first_seq = sent[0].seq;

    // The peer saw segments 1-2 but segment 3 was lost: a cumulative ACK
    // for two segments, then three duplicates of it (same window).
    let ack3 = first_seq.wrapping_add(2 * mss);
    h.inject(8081, local_port, peer_seq, ack3, ACK, 65535, None, &[]);
    assert!(h.sent().is_empty());

    for _ in 0..2 {
        h.inject(8081, local_port, peer_seq, ack3, ACK, 65535, None, &[]);
        assert!(h.sent().is_empty(), "two duplicates do not trigger anything");
    }
    h.inject(8081, local_port, peer_seq, ack3, ACK, 65535, None, &[]);

    // Third duplicate: exactly the missing segment is retransmitted.
    let rtx = h.sent();
    assert_eq!(rtx.len(), 1);
    assert_eq!(rtx[0].seq, ack3);
    assert_eq!(rtx[0].payload.len(), mss as usize);

    {
        let s = sock.inner.lock();
        // FlightSize was 3 segments: ssthresh = max(2*MSS, flight/2).
        assert_eq!(s.ssthresh, 2 * mss);
        assert_eq!(s.cwnd, s.ssthresh + 3 * mss, "inflated by the three duplicates");
    }

    // The cumulative ACK deflates cwnd back to ssthresh.
    let ack_all = first_seq.wrapping_add(5 * mss);
    h.inject(8081, local_port, peer_seq, ack_all, ACK, 65535, None, &[]);
    {
        let s = sock.inner.lock();
        assert_eq!(s.cwnd, s.ssthresh);
        assert_eq!(s.dupacks, 0);
    }

    h.inject(8081, local_port, peer_seq, ack_all, RST, 0, None, &[]);
}

#[test]
fn zero_window_persist_probe() {
    let _guard = serialize();
    let h = Harness::new(4);
    // The peer opens with a zero window: everything we queue must wait.
    let (sock, local_port, peer_seq) = established(&h, 8082, 0);

    let data = std::vec![0x17u8; 4096];
    assert_eq!(send(&sock, &data).unwrap(), 4096);
    assert!(h.sent().is_empty(), "window is closed, nothing goes out");
    let resume_seq = {
        let s = sock.inner.lock();
        assert!(s.persist.time > 0, "persist timer armed on the closed window");
        assert_eq!(s.rtx.time, 0, "rtx stays disarmed while probing");
        s.snd_nxt
    };

    // Let the persist timer expire: exactly one 1-byte probe.
    for _ in 0..RTO_INIT {
        timer::tick();
    }
    let probes = h.sent();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].payload.len(), 1);
    assert_eq!(probes[0].seq, resume_seq);

    // Still zero: the sender backs off and probes again later.
    h.inject(8082, local_port, peer_seq, resume_seq, ACK, 0, None, &[]);
    let backoff_time = sock.inner.lock().persist.time;
    assert!(backoff_time > RTO_INIT, "exponential persist backoff");
    for _ in 0..backoff_time {
        timer::tick();
    }
    let probes = h.sent();
    assert_eq!(probes.len(), 1);

    // The window finally opens: transmission resumes from SND.UNA.
    h.inject(8082, local_port, peer_seq, resume_seq, ACK, 4096, None, &[]);
    let out = h.sent();
    assert!(!out.is_empty());
    assert_eq!(out[0].seq, resume_seq, "resumes from SND.UNA, not SND.NXT-1");
    let total: usize = out.iter().map(|s| s.payload.len()).sum();
    assert!(total <= 4096);

    h.inject(8082, local_port, peer_seq, resume_seq, RST, 0, None, &[]);
}

#[test]
fn out_of_order_segments_are_discarded() {
    let _guard = serialize();
    let h = Harness::new(5);
    let (sock, local_port, peer_seq) = established(&h, 8083, 16384);

    // In-order data lands in the buffer.
    h.inject(8083, local_port, peer_seq, iss_of(&sock), ACK | PSH, 16384, None, b"abcd");
    // A gap: this segment must vanish without a trace in the buffer...
    h.inject(
        8083,
        local_port,
        peer_seq.wrapping_add(100),
        iss_of(&sock),
        ACK | PSH,
        16384,
        None,
        b"LOST",
    );
    // ...except for the immediate duplicate ACK it provokes.
    let out = h.sent();
    let dup = out.last().unwrap();
    assert_eq!(dup.flags & ACK, ACK);
    assert_eq!(dup.ack, peer_seq.wrapping_add(4), "still asking for the gap");

    let mut buf = [0u8; 64];
    assert_eq!(recv(&sock, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"abcd");
    assert_eq!(recv(&sock, &mut buf), Err(Errno::Again));

    // Retransmission filling the hole is accepted in sequence.
    h.inject(8083, local_port, peer_seq.wrapping_add(4), iss_of(&sock), ACK | PSH, 16384, None, b"efgh");
    assert_eq!(recv(&sock, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"efgh");

    h.inject(8083, local_port, peer_seq.wrapping_add(8), iss_of(&sock), RST, 0, None, &[]);
}

fn iss_of(sock: &Arc<Socket>) -> u32 {
    sock.inner.lock().snd_nxt
}

#[test]
fn delayed_ack_coalesces_single_segments() {
    let _guard = serialize();
    let h = Harness::new(6);
    let (sock, local_port, peer_seq) = established(&h, 8084, 16384);

    // One data segment: the ACK is delayed...
    h.inject(8084, local_port, peer_seq, iss_of(&sock), ACK | PSH, 16384, None, b"first");
    assert!(h.sent().is_empty());
    assert!(sock.inner.lock().delack.time > 0);

    // ...and flushed by the timer.
    timer::tick();
    let acks = h.sent();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack, peer_seq.wrapping_add(5));

    // Two back-to-back segments: the second forces an immediate ACK.
    h.inject(8084, local_port, peer_seq.wrapping_add(5), iss_of(&sock), ACK | PSH, 16384, None, b"12345");
    assert!(h.sent().is_empty());
    h.inject(8084, local_port, peer_seq.wrapping_add(10), iss_of(&sock), ACK | PSH, 16384, None, b"67890");
    let acks = h.sent();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack, peer_seq.wrapping_add(15));

    h.inject(8084, local_port, peer_seq.wrapping_add(15), iss_of(&sock), RST, 0, None, &[]);
}

#[test]
fn orderly_close_reaches_time_wait_and_expires() {
    let _guard = serialize();
    let h = Harness::new(7);
    let (sock, local_port, peer_seq) = established(&h, 8085, 16384);
    let before = snapshot().len();

    close(&sock);
    let fins = h.sent();
    assert_eq!(fins.len(), 1);
    let fin_seq = fins[0].seq;
    assert_eq!(fins[0].flags & FIN, FIN);
    assert_eq!(status(&sock), TcpState::FinWait1);

    // Peer ACKs our FIN, then sends its own.
    h.inject(8085, local_port, peer_seq, fin_seq.wrapping_add(1), ACK, 16384, None, &[]);
    assert_eq!(status(&sock), TcpState::FinWait2);
    h.inject(8085, local_port, peer_seq, fin_seq.wrapping_add(1), FIN | ACK, 16384, None, &[]);
    assert_eq!(status(&sock), TcpState::TimeWait);
    let acks = h.sent();
    assert_eq!(acks.last().unwrap().ack, peer_seq.wrapping_add(1));

    // 2·MSL later the socket is gone.
    for _ in 0..(2 * MSL) {
        timer::tick();
    }
    assert_eq!(status(&sock), TcpState::Closed);
    assert_eq!(snapshot().len(), before - 1);
}

#[test]
fn retransmission_times_out_with_backoff() {
    let _guard = serialize();
    let h = Harness::new(8);
    let (sock, local_port, peer_seq) = established(&h, 8086, 16384);

    assert_eq!(send(&sock, b"doomed data").unwrap(), 11);
    let first = h.sent();
    assert_eq!(first.len(), 1);
    let rto = sock.inner.lock().rtx.time;
    assert!(rto > 0);

    // First expiry: one retransmission, doubled timer.
    for _ in 0..rto {
        timer::tick();
    }
    let rtx = h.sent();
    assert_eq!(rtx.len(), 1);
    assert_eq!(rtx[0].seq, first[0].seq, "go-back-N from SND.UNA");
    let rto2 = sock.inner.lock().rtx.time;
    assert!(rto2 > rto, "exponential backoff");
    {
        let s = sock.inner.lock();
        assert_eq!(s.cwnd, super::sock::IW * s.smss as u32, "cwnd collapsed");
    }

    // An ACK rescues it and resets the retry budget.
    h.inject(8086, local_port, peer_seq, first[0].seq.wrapping_add(11), ACK, 16384, None, &[]);
    {
        let s = sock.inner.lock();
        assert_eq!(s.rtx_count, 0);
        assert_eq!(s.rtx.time, 0, "nothing left in flight");
    }

    h.inject(8086, local_port, peer_seq, first[0].seq.wrapping_add(11), RST, 0, None, &[]);
}

#[test]
fn reset_tears_the_connection_down() {
    let _guard = serialize();
    let h = Harness::new(9);
    let (sock, local_port, peer_seq) = established(&h, 8087, 16384);
    let before = snapshot().len();

    h.inject(8087, local_port, peer_seq, iss_of(&sock), RST, 0, None, &[]);
    assert_eq!(status(&sock), TcpState::Closed);
    assert_eq!(snapshot().len(), before - 1);
    let mut buf = [0u8; 4];
    assert_eq!(recv(&sock, &mut buf), Err(Errno::ConnReset));
}

#[test]
fn stray_segment_gets_a_reset() {
    let _guard = serialize();
    let h = Harness::new(10);
    // No socket listens on this port at all.
    h.inject(40000, 4242, 777, 0, SYN, 1024, None, &[]);
    let out = h.sent();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].flags & RST, RST);
    assert_eq!(out[0].ack, 778, "RST acknowledges the SYN");
}
