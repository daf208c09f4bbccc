//! Incoming segment processing, organized as RFC 793's "segment arrives"
//! table: closed/listener dispatch, the SYN_SENT special case, then the
//! synchronized states with the acceptability check, RST/SYN handling,
//! ACK processing (with RFC 5681 congestion reactions), in-order data
//! acceptance, and FIN transitions. Out-of-order segments are discarded
//! with an immediate duplicate ACK; there is no reassembly queue.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::Ordering;

use crate::net::checksum;
use crate::net::ip::{self, Ipv4Packet};
use crate::net::types::Ipv4Addr;

use super::output::{self, make_segment, send_rst_for, Outgoing, ACK, FIN, PSH, RST, SYN};
use super::sock::{
    compute_win, seq_gt, seq_gte, seq_lt, seq_lte, SockState, Socket, TcpState, DEFAULT_MSS, IW,
    MSL, RECV_BUF_SIZE,
};
use super::{lookup, uninstall, SEGMENTS_RECV};

/// A parsed incoming segment.
pub(crate) struct Segment {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// MSS option (SYN segments only).
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

/// Parse and checksum-verify one TCP segment.
pub(crate) fn parse_tcp(pkt: &Ipv4Packet<'_>) -> Option<Segment> {
    let data = pkt.payload;
    if data.len() < output::TCP_HEADER_LEN {
        return None;
    }

    let sum = checksum::sum_bytes(
        checksum::pseudo_header_sum(&pkt.src.0, &pkt.dst.0, ip::PROTO_TCP, data.len() as u16),
        data,
    );
    if checksum::finish(sum) != 0 {
        log::debug!(target: "tcp", "bad checksum from {}", pkt.src);
        return None;
    }

    let data_offset = ((data[12] >> 4) as usize) * 4;
    if data_offset < output::TCP_HEADER_LEN || data_offset > data.len() {
        return None;
    }

    // Options: MSS (kind 2) only; everything else is skipped.
    let mut mss = None;
    let opts = &data[output::TCP_HEADER_LEN..data_offset];
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            2 if i + 4 <= opts.len() && opts[i + 1] == 4 => {
                mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                i += 4;
            }
            _ => {
                if i + 1 < opts.len() && opts[i + 1] >= 2 {
                    i += opts[i + 1] as usize;
                } else {
                    break;
                }
            }
        }
    }

    Some(Segment {
        src_ip: pkt.src,
        dst_ip: pkt.dst,
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: data[13] & 0x3F,
        window: u16::from_be_bytes([data[14], data[15]]),
        mss,
        payload: Vec::from(&data[data_offset..]),
    })
}

/// Entry point from the IP layer.
pub fn handle_segment(pkt: &Ipv4Packet<'_>) {
    let seg = match parse_tcp(pkt) {
        Some(s) => s,
        None => return,
    };
    SEGMENTS_RECV.fetch_add(1, Ordering::Relaxed);

    let sock = lookup(seg.dst_ip, seg.dst_port, seg.src_ip, seg.src_port);
    match sock {
        None => {
            // No connection at all: answer with RST unless this is one.
            if seg.flags & RST == 0 {
                let ack_val = seg
                    .seq
                    .wrapping_add(seg.payload.len() as u32)
                    .wrapping_add((seg.flags & SYN != 0) as u32)
                    .wrapping_add((seg.flags & FIN != 0) as u32);
                send_rst_for(
                    seg.dst_ip,
                    seg.dst_port,
                    seg.src_ip,
                    seg.src_port,
                    ack_val,
                    seg.ack,
                    seg.flags & ACK != 0,
                );
            }
        }
        Some(sock) => {
            let state = sock.inner.lock().state;
            match state {
                TcpState::Listen => handle_listen(&sock, &seg),
                TcpState::SynSent => handle_syn_sent(&sock, &seg),
                _ => handle_synchronized(&sock, &seg),
            }
        }
    }
}

/// LISTEN: a SYN spawns a SYN_RCVD child on the backlog; a stray ACK is
/// answered with RST; everything else is dropped.
fn handle_listen(listener: &Arc<Socket>, seg: &Segment) {
    if seg.flags & RST != 0 {
        return;
    }
    if seg.flags & ACK != 0 {
        send_rst_for(
            seg.dst_ip, seg.dst_port, seg.src_ip, seg.src_port, 0, seg.ack, true,
        );
        return;
    }
    if seg.flags & SYN == 0 {
        return;
    }

    {
        let l = listener.inner.lock();
        if l.backlog.len() >= l.backlog_max {
            log::debug!(target: "tcp", "backlog full, SYN from {} dropped", seg.src_ip);
            return;
        }
    }

    let mut child = SockState::new();
    child.local_ip = seg.dst_ip;
    child.local_port = seg.dst_port;
    child.remote_ip = seg.src_ip;
    child.remote_port = seg.src_port;
    child.rcv_nxt = seg.seq.wrapping_add(1);
    child.snd_wnd = seg.window as u32;
    child.max_snd_wnd = seg.window as u32;
    child.smss = seg.mss.unwrap_or(536).min(DEFAULT_MSS);
    child.cwnd = IW * child.smss as u32;
    child.state = TcpState::SynRcvd;
    child.parent = Some(Arc::clone(listener));

    let child = match super::install(child) {
        Ok(c) => c,
        Err(_) => return,
    };
    listener.inner.lock().backlog.push(Arc::clone(&child));
    super::PASSIVE_OPENS.fetch_add(1, Ordering::Relaxed);
    log::debug!(target: "tcp", "SYN from {}:{} -> new connection", seg.src_ip, seg.src_port);
    output::send_syn(&child, true);
}

/// SYN_SENT: waiting for the SYN-ACK of an active open.
fn handle_syn_sent(sock: &Arc<Socket>, seg: &Segment) {
    let mut outgoing: Vec<Outgoing> = Vec::new();
    let mut drop_socket = false;
    {
        let mut s = sock.inner.lock();

        if seg.flags & ACK != 0
            && (seq_lte(seg.ack, s.iss) || seq_gt(seg.ack, s.snd_nxt))
        {
            if seg.flags & RST == 0 {
                send_rst_for(
                    s.local_ip, s.local_port, s.remote_ip, s.remote_port, 0, seg.ack, true,
                );
            }
            return;
        }

        if seg.flags & RST != 0 {
            if seg.flags & ACK != 0 {
                s.refused = true;
                s.state = TcpState::Closed;
                drop_socket = true;
            }
        } else if seg.flags & SYN != 0 {
            s.rcv_nxt = seg.seq.wrapping_add(1);
            if let Some(mss) = seg.mss {
                s.smss = s.smss.min(mss);
                s.cwnd = IW * s.smss as u32;
            }
            if seg.flags & ACK != 0 {
                s.snd_una = seg.ack;
                s.snd_wnd = seg.window as u32;
                s.max_snd_wnd = seg.window as u32;
                s.snd_wl1 = seg.seq;
                s.snd_wl2 = seg.ack;
                s.state = TcpState::Established;
                s.rtx = Default::default();
                s.rtx_count = 0;
                let win = compute_win(&mut s);
                outgoing.push(make_segment(&s, s.snd_nxt, ACK, win, None, &[]));
            } else {
                // Simultaneous open: answer with SYN-ACK from our ISS.
                s.state = TcpState::SynRcvd;
                let win = compute_win(&mut s);
                let seg_out = make_segment(&s, s.iss, SYN | ACK, win, Some(s.rmss), &[]);
                outgoing.push(seg_out);
            }
        }
    }
    for out in outgoing {
        out.transmit();
    }
    if drop_socket {
        uninstall(sock);
    }
}

/// Everything from SYN_RCVD onward.
fn handle_synchronized(sock: &Arc<Socket>, seg: &Segment) {
    let mut outgoing: Vec<Outgoing> = Vec::new();
    let mut drop_socket = false;
    let mut poke_sender = false;

    {
        let mut s = sock.inner.lock();
        let seg_len = seg.payload.len() as u32
            + (seg.flags & SYN != 0) as u32
            + (seg.flags & FIN != 0) as u32;

        // ── Acceptability (RFC 793 p.69) ──
        let wnd = s.adv_right_edge.wrapping_sub(s.rcv_nxt);
        let acceptable = if seg_len == 0 && wnd == 0 {
            seg.seq == s.rcv_nxt
        } else if seg_len == 0 {
            seq_gte(seg.seq, s.rcv_nxt) && seq_lt(seg.seq, s.rcv_nxt.wrapping_add(wnd))
        } else if wnd == 0 {
            false
        } else {
            let first_in = seq_gte(seg.seq, s.rcv_nxt)
                && seq_lt(seg.seq, s.rcv_nxt.wrapping_add(wnd));
            let last = seg.seq.wrapping_add(seg_len - 1);
            let last_in =
                seq_gte(last, s.rcv_nxt) && seq_lt(last, s.rcv_nxt.wrapping_add(wnd));
            first_in || last_in
        };
        if !acceptable {
            if seg.flags & RST == 0 {
                let win = compute_win(&mut s);
                outgoing.push(make_segment(&s, s.snd_nxt, ACK, win, None, &[]));
            }
            drop(s);
            for out in outgoing {
                out.transmit();
            }
            return;
        }

        // ── RST ──
        if seg.flags & RST != 0 {
            log::debug!(target: "tcp", "RST from {}:{}", s.remote_ip, s.remote_port);
            s.reset = true;
            s.state = TcpState::Closed;
            drop_socket = true;
        } else if seg.flags & SYN != 0 {
            // A SYN inside the window is fatal.
            let seg_out = make_segment(&s, s.snd_nxt, RST, 0, None, &[]);
            outgoing.push(seg_out);
            s.reset = true;
            s.state = TcpState::Closed;
            drop_socket = true;
        } else if seg.flags & ACK == 0 {
            // Everything past this point requires an ACK.
        } else {
            process_ack(&mut s, seg, &mut outgoing, &mut drop_socket, &mut poke_sender);
            if !drop_socket {
                accept_data(&mut s, seg, &mut outgoing);
                process_fin(&mut s, seg, &mut outgoing);
            }
        }
    }

    for out in outgoing {
        out.transmit();
    }
    if poke_sender {
        output::trigger_send(sock, false);
    }
    if drop_socket {
        uninstall(sock);
    }
}

/// ACK processing: handshake completion, new-data acknowledgement with
/// congestion window growth, duplicate-ACK counting with fast retransmit,
/// window updates, and our-FIN-acknowledged transitions.
fn process_ack(
    s: &mut SockState,
    seg: &Segment,
    outgoing: &mut Vec<Outgoing>,
    drop_socket: &mut bool,
    poke_sender: &mut bool,
) {
    // SYN_RCVD completes the handshake here.
    if s.state == TcpState::SynRcvd {
        if seq_gt(seg.ack, s.snd_una) && seq_lte(seg.ack, s.snd_nxt) {
            s.snd_una = seg.ack;
            s.snd_wnd = seg.window as u32;
            s.max_snd_wnd = s.max_snd_wnd.max(seg.window as u32);
            s.snd_wl1 = seg.seq;
            s.snd_wl2 = seg.ack;
            s.state = TcpState::Established;
            s.rtx = Default::default();
            s.rtx_count = 0;
            log::debug!(target: "tcp", "{}:{} established (passive)", s.remote_ip, s.remote_port);
        } else {
            let out = make_segment(s, seg.ack, RST, 0, None, &[]);
            outgoing.push(out);
            return;
        }
    }

    // ACK for something we never sent: answer and stop.
    if seq_gt(seg.ack, s.snd_max) {
        let win = compute_win(s);
        let out = make_segment(s, s.snd_nxt, ACK, win, None, &[]);
        outgoing.push(out);
        return;
    }

    let dup_window_unchanged = seg.window as u32 == s.snd_wnd;

    if seq_gt(seg.ack, s.snd_una) {
        // ── New ACK ──
        let acked = seg.ack.wrapping_sub(s.snd_una);
        let fin_acked = s.fin_sent && seq_gt(seg.ack, s.fin_seq);
        let data_acked = if fin_acked { acked.saturating_sub(1) } else { acked };

        let drain = (data_acked as usize).min(s.send_buf.len());
        s.send_buf.drain(..drain);
        s.snd_una = seg.ack;
        if seq_lt(s.snd_nxt, s.snd_una) {
            s.snd_nxt = s.snd_una;
        }

        // Congestion window (RFC 5681), unless disabled by parameter.
        if !crate::config::tcp_disable_cc() {
            let smss = s.smss as u32;
            if s.dupacks >= 3 {
                // Fast-recovery deflation on the cumulative ACK.
                s.cwnd = s.ssthresh;
            } else if s.cwnd < s.ssthresh {
                s.cwnd += acked.min(smss);
            } else {
                s.ack_count += acked;
                if s.ack_count >= s.cwnd {
                    s.ack_count = 0;
                    s.cwnd += smss;
                }
            }
        }
        s.dupacks = 0;
        s.rtx_count = 0;
        s.rtx.backoff = 0;
        s.rtx.time = if s.snd_una == s.snd_max { 0 } else { s.rto_current() };

        // RTT sample when the timed sequence is covered (Karn-safe).
        if let Some(timed) = s.timed_seq {
            if seq_gt(seg.ack, timed) {
                let sample = s.timed_ticks;
                s.update_rtt(sample);
                s.timed_seq = None;
            }
        }

        // Our FIN got acknowledged: advance the close.
        if fin_acked {
            match s.state {
                TcpState::FinWait1 => s.state = TcpState::FinWait2,
                TcpState::Closing => {
                    s.state = TcpState::TimeWait;
                    s.time_wait.time = 2 * MSL;
                }
                TcpState::LastAck => {
                    s.state = TcpState::Closed;
                    *drop_socket = true;
                }
                _ => {}
            }
        }
        *poke_sender = true;
    } else if seg.ack == s.snd_una
        && seg.payload.is_empty()
        && seg.flags & (SYN | FIN) == 0
        && s.snd_una != s.snd_max
        && dup_window_unchanged
    {
        // ── Duplicate ACK (RFC 5681 definition) ──
        s.dupacks += 1;
        if s.dupacks == 3 {
            let smss = s.smss as u32;
            let flight = s.flight_size();
            s.ssthresh = (flight / 2).max(2 * smss);
            if !crate::config::tcp_disable_cc() {
                s.cwnd = s.ssthresh + 3 * smss;
            }
            // Retransmit the missing segment (one pass from SND.UNA).
            let len = (s.send_buf.len()).min(smss as usize);
            if len > 0 {
                let payload = output_copy(s, len);
                let win = compute_win(s);
                let seq = s.snd_una;
                super::RETRANSMITS.fetch_add(1, Ordering::Relaxed);
                s.timed_seq = None;
                let out = make_segment(s, seq, ACK | PSH, win, None, &payload);
                outgoing.push(out);
                log::debug!(target: "tcp", "fast retransmit seq={}", seq);
            }
        }
    }

    // ── Window update (RFC 793 ordering check) ──
    if seq_gt(seg.ack, s.snd_wl2)
        || seq_lt(s.snd_wl1, seg.seq)
        || (s.snd_wl1 == seg.seq && seq_lte(s.snd_wl2, seg.ack))
    {
        s.snd_wnd = seg.window as u32;
        s.max_snd_wnd = s.max_snd_wnd.max(s.snd_wnd);
        s.snd_wl1 = seg.seq;
        s.snd_wl2 = seg.ack;
        if s.snd_wnd > 0 {
            // The window opened: probing is over.
            s.persist = Default::default();
            *poke_sender = true;
        }
    }
}

fn output_copy(s: &SockState, len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let (front, back) = s.send_buf.as_slices();
    let take = front.len().min(len);
    data.extend_from_slice(&front[..take]);
    if take < len {
        data.extend_from_slice(&back[..len - take]);
    }
    data
}

/// In-order data acceptance. Bytes left of `rcv_nxt` are clipped; a
/// segment starting beyond `rcv_nxt` is discarded entirely and answered
/// with an immediate duplicate ACK.
fn accept_data(s: &mut SockState, seg: &Segment, outgoing: &mut Vec<Outgoing>) {
    if seg.payload.is_empty() {
        return;
    }
    if !matches!(
        s.state,
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
    ) {
        return;
    }

    if seq_gt(seg.seq, s.rcv_nxt) {
        // A gap: no reassembly, ask for the missing bytes right away.
        let win = compute_win(s);
        let out = make_segment(s, s.snd_nxt, ACK, win, None, &[]);
        outgoing.push(out);
        return;
    }

    let skip = s.rcv_nxt.wrapping_sub(seg.seq) as usize;
    if skip >= seg.payload.len() {
        return; // nothing new (pure retransmission of old data)
    }
    let fresh = &seg.payload[skip..];
    let space = RECV_BUF_SIZE - s.recv_buf.len();
    let take = fresh.len().min(space);
    if take == 0 {
        return;
    }
    s.recv_buf.extend(fresh[..take].iter().copied());
    s.rcv_nxt = s.rcv_nxt.wrapping_add(take as u32);

    if s.delack.time == 0 {
        // First unacknowledged data segment: delay the ACK.
        s.delack.time = super::sock::DELACK_TIME;
    } else {
        // Second segment: acknowledge immediately (ACK every other).
        s.delack = Default::default();
        let win = compute_win(s);
        let out = make_segment(s, s.snd_nxt, ACK, win, None, &[]);
        outgoing.push(out);
    }
}

/// FIN processing: only a FIN that lands exactly at `rcv_nxt` (all data
/// before it consumed, inside the window) is honored.
fn process_fin(s: &mut SockState, seg: &Segment, outgoing: &mut Vec<Outgoing>) {
    if seg.flags & FIN == 0 {
        return;
    }
    let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
    if fin_seq != s.rcv_nxt {
        return; // out of order or outside the window: ignored
    }
    match s.state {
        TcpState::Established | TcpState::SynRcvd => s.state = TcpState::CloseWait,
        TcpState::FinWait1 => {
            if s.fin_sent && seq_gt(s.snd_una, s.fin_seq) {
                s.state = TcpState::TimeWait;
                s.time_wait.time = 2 * MSL;
            } else {
                s.state = TcpState::Closing;
            }
        }
        TcpState::FinWait2 => {
            s.state = TcpState::TimeWait;
            s.time_wait.time = 2 * MSL;
        }
        _ => return,
    }
    s.rcv_nxt = s.rcv_nxt.wrapping_add(1);
    s.eof = true;
    s.delack = Default::default();
    let win = compute_win(s);
    let out = make_segment(s, s.snd_nxt, ACK, win, None, &[]);
    outgoing.push(out);
}
