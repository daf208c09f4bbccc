//! Segment construction and the send engine.
//!
//! `trigger_send` implements the sender-side silly-window avoidance: per
//! iteration it sends only if (a) nothing is unacknowledged and all
//! remaining data fits, (b) at least half of the peer's largest-ever
//! window can go, (c) a full MSS can go, (d) the caller forces it, or
//! (e) only a FIN remains. With the peer's window closed and data
//! pending it arms the persist timer instead.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::Ordering;

use crate::net::checksum;
use crate::net::ip;
use crate::net::types::Ipv4Addr;

use super::sock::{self, compute_win, seq_lt, SockState, Socket, TcpState};
use super::{RESETS_SENT, SEGMENTS_SENT};

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

pub const TCP_HEADER_LEN: usize = 20;

/// Build one segment on the wire: header, optional MSS option (SYN
/// segments only), payload, one's-complement checksum over the
/// pseudo-header + header + data.
pub fn build_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> Vec<u8> {
    let opt_len = if mss.is_some() { 4 } else { 0 };
    let header_len = TCP_HEADER_LEN + opt_len;
    let mut seg = Vec::with_capacity(header_len + payload.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(((header_len / 4) as u8) << 4);
    seg.push(flags);
    seg.extend_from_slice(&window.to_be_bytes());
    seg.extend_from_slice(&[0, 0]); // checksum placeholder
    seg.extend_from_slice(&[0, 0]); // urgent pointer (unused)
    if let Some(mss) = mss {
        seg.push(2);
        seg.push(4);
        seg.extend_from_slice(&mss.to_be_bytes());
    }
    seg.extend_from_slice(payload);

    let sum = checksum::sum_bytes(
        checksum::pseudo_header_sum(&src.0, &dst.0, ip::PROTO_TCP, seg.len() as u16),
        &seg,
    );
    let ck = checksum::finish(sum);
    seg[16..18].copy_from_slice(&ck.to_be_bytes());
    seg
}

/// A segment prepared under the socket lock, transmitted after it drops.
pub(crate) struct Outgoing {
    pub dst: Ipv4Addr,
    pub segment: Vec<u8>,
}

impl Outgoing {
    pub(crate) fn transmit(self) {
        SEGMENTS_SENT.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = ip::send_ipv4(self.dst, ip::PROTO_TCP, &self.segment) {
            log::warn!(target: "tcp", "segment transmit failed: {}", e);
        }
    }
}

pub(crate) fn make_segment(
    s: &SockState,
    seq: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> Outgoing {
    Outgoing {
        dst: s.remote_ip,
        segment: build_segment(
            s.local_ip,
            s.remote_ip,
            s.local_port,
            s.remote_port,
            seq,
            if flags & ACK != 0 { s.rcv_nxt } else { 0 },
            flags,
            window,
            mss,
            payload,
        ),
    }
}

/// Emit a SYN (active open) or SYN-ACK (passive open) carrying our MSS.
pub(crate) fn send_syn(sock: &Arc<Socket>, synack: bool) {
    let out = {
        let mut s = sock.inner.lock();
        let flags = if synack { SYN | ACK } else { SYN };
        let win = compute_win(&mut s);
        let seg = make_segment(&s, s.iss, flags, win, Some(s.rmss), &[]);
        s.snd_nxt = s.iss.wrapping_add(1);
        s.snd_max = s.snd_nxt;
        if s.rtx.time == 0 {
            s.rtx.time = sock::SYN_TIMEOUT << s.rtx.backoff.min(4);
        }
        seg
    };
    out.transmit();
}

/// Emit a pure ACK with the current window.
pub(crate) fn send_ack(sock: &Arc<Socket>) {
    let out = {
        let mut s = sock.inner.lock();
        s.delack = Default::default();
        let win = compute_win(&mut s);
        make_segment(&s, s.snd_nxt, ACK, win, None, &[])
    };
    out.transmit();
}

/// RST for a segment that arrived with no usable connection.
pub(crate) fn send_rst_for(
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    seq: u32,
    ack: u32,
    ack_valid: bool,
) {
    RESETS_SENT.fetch_add(1, Ordering::Relaxed);
    let segment = if ack_valid {
        build_segment(local_ip, remote_ip, local_port, remote_port, ack, 0, RST, 0, None, &[])
    } else {
        build_segment(local_ip, remote_ip, local_port, remote_port, 0, seq, RST | ACK, 0, None, &[])
    };
    Outgoing { dst: remote_ip, segment }.transmit();
}

/// Copy `len` bytes starting `offset` bytes into the send buffer.
fn copy_from_send_buf(s: &SockState, offset: usize, len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let (front, back) = s.send_buf.as_slices();
    if offset < front.len() {
        let take = (front.len() - offset).min(len);
        data.extend_from_slice(&front[offset..offset + take]);
        if take < len {
            data.extend_from_slice(&back[..len - take]);
        }
    } else {
        let boff = offset - front.len();
        data.extend_from_slice(&back[boff..boff + len]);
    }
    data
}

/// The send engine. Iterates while sendable bytes remain; see the module
/// docs for the decision rules.
pub(crate) fn trigger_send(sock: &Arc<Socket>, force: bool) {
    let mut outgoing: Vec<Outgoing> = Vec::new();
    {
        let mut s = sock.inner.lock();
        let mut force = force;

        let data_state = matches!(
            s.state,
            TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 | TcpState::Closing
        );
        if !data_state && !matches!(s.state, TcpState::SynRcvd | TcpState::LastAck) {
            return;
        }

        loop {
            let in_flight = s.snd_nxt.wrapping_sub(s.snd_una);
            // Sequence space consumed by an already-sent FIN is not buffer.
            let data_in_flight = if s.fin_sent { in_flight.saturating_sub(1) } else { in_flight };
            let buffered = s.send_buf.len() as u32;
            let unsent = buffered.saturating_sub(data_in_flight);
            let can_send_data =
                matches!(s.state, TcpState::Established | TcpState::CloseWait) && !s.fin_sent;
            let fin_pending = s.closed
                && !s.fin_sent
                && matches!(s.state, TcpState::Established | TcpState::CloseWait | TcpState::SynRcvd);

            if unsent > 0 && can_send_data {
                let usable = s.effective_wnd().saturating_sub(in_flight);
                let len = unsent.min(usable).min(s.smss as u32);

                let send_ok = len > 0
                    && ((in_flight == 0 && unsent <= usable)
                        || (s.max_snd_wnd > 0 && len >= s.max_snd_wnd / 2)
                        || len == s.smss as u32
                        || force);

                if !send_ok {
                    // Peer window shut with data waiting: arm the persist
                    // timer unless a retransmission is already pending.
                    if s.snd_wnd == 0 && s.persist.time == 0 && s.rtx.time == 0 {
                        s.persist.time = s.rto_current();
                    }
                    break;
                }
                force = false;

                let offset = data_in_flight as usize;
                let payload = copy_from_send_buf(&s, offset, len as usize);
                let push = if len == unsent { PSH } else { 0 };
                let seq = s.snd_nxt;
                let win = compute_win(&mut s);
                outgoing.push(make_segment(&s, seq, ACK | push, win, None, &payload));

                s.snd_nxt = s.snd_nxt.wrapping_add(len);
                if seq_lt(s.snd_max, s.snd_nxt) {
                    s.snd_max = s.snd_nxt;
                }
                if s.rtx.time == 0 {
                    s.rtx.time = s.rto_current();
                }
                // Karn: only first transmissions (at the send frontier,
                // outside a recovery episode) are timed.
                if s.timed_seq.is_none() && s.rtx_count == 0 && seq == s.snd_max.wrapping_sub(len) {
                    s.timed_seq = Some(seq);
                    s.timed_ticks = 0;
                }
                s.delack = Default::default();
                continue;
            }

            if fin_pending && unsent == 0 {
                let seq = s.snd_nxt;
                let win = compute_win(&mut s);
                outgoing.push(make_segment(&s, seq, FIN | ACK, win, None, &[]));
                s.fin_sent = true;
                s.fin_seq = seq;
                s.snd_nxt = s.snd_nxt.wrapping_add(1);
                if seq_lt(s.snd_max, s.snd_nxt) {
                    s.snd_max = s.snd_nxt;
                }
                if s.rtx.time == 0 {
                    s.rtx.time = s.rto_current();
                }
                s.state = match s.state {
                    TcpState::CloseWait => TcpState::LastAck,
                    // Established and SYN_RCVD close toward FIN_WAIT_1.
                    _ => TcpState::FinWait1,
                };
            }
            break;
        }
    }
    for out in outgoing {
        out.transmit();
    }
}

/// Resend exactly one MSS from `snd_una` (fast retransmit and the
/// zero-window probe path reuse this shape).
pub(crate) fn retransmit_head(sock: &Arc<Socket>, probe_one_byte: bool) {
    let out = {
        let mut s = sock.inner.lock();
        let len = if probe_one_byte {
            // The probe carries the first unsent byte, at snd_nxt.
            let in_flight = s.snd_nxt.wrapping_sub(s.snd_una) as usize;
            if s.send_buf.len() <= in_flight {
                None
            } else {
                Some((in_flight, 1))
            }
        } else if s.send_buf.is_empty() {
            None
        } else {
            Some((0usize, s.send_buf.len().min(s.smss as usize)))
        };
        match len {
            None => {
                // Nothing buffered: a bare ACK still probes the window.
                let win = compute_win(&mut s);
                Some(make_segment(&s, s.snd_nxt, ACK, win, None, &[]))
            }
            Some((offset, n)) => {
                let payload = copy_from_send_buf(&s, offset, n);
                let seq = if probe_one_byte { s.snd_nxt } else { s.snd_una };
                let win = compute_win(&mut s);
                super::RETRANSMITS.fetch_add(1, Ordering::Relaxed);
                // Karn: a resent sequence is never timed.
                s.timed_seq = None;
                Some(make_segment(&s, seq, ACK | PSH, win, None, &payload))
            }
        }
    };
    if let Some(out) = out {
        out.transmit();
    }
}
