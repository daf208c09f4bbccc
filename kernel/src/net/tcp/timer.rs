//! The 250 ms timer tick.
//!
//! Each tick decrements every socket's four timers. Retransmission
//! expiry performs go-back-N with exponential backoff and congestion
//! collapse; persist expiry probes a closed peer window with one byte;
//! delayed-ACK expiry flushes the pending acknowledgement; TIME_WAIT
//! expiry finally drops the socket. Sockets are iterated from a snapshot
//! of references taken under the list lock, then locked one at a time.

use alloc::sync::Arc;

use super::output;
use super::sock::{seq_lte, Socket, TcpState, IW, MAX_RTX, RTO_MAX, SYN_TIMEOUT};
use super::{snapshot, uninstall};

/// Advance every socket's timers by one 250 ms tick.
pub fn tick() {
    for sock in snapshot() {
        run_timers(&sock);
    }
}

enum Expired {
    Rtx,
    Persist,
    Delack,
    TimeWait,
}

fn run_timers(sock: &Arc<Socket>) {
    let mut expired: alloc::vec::Vec<Expired> = alloc::vec::Vec::new();
    {
        let mut s = sock.inner.lock();

        if s.timed_seq.is_some() {
            s.timed_ticks += 1;
        }

        if s.rtx.time > 0 {
            s.rtx.time -= 1;
            if s.rtx.time == 0 {
                expired.push(Expired::Rtx);
            }
        }
        if s.persist.time > 0 {
            s.persist.time -= 1;
            if s.persist.time == 0 {
                expired.push(Expired::Persist);
            }
        }
        if s.delack.time > 0 {
            s.delack.time -= 1;
            if s.delack.time == 0 {
                expired.push(Expired::Delack);
            }
        }
        if s.time_wait.time > 0 {
            s.time_wait.time -= 1;
            if s.time_wait.time == 0 {
                expired.push(Expired::TimeWait);
            }
        }
    }

    for e in expired {
        match e {
            Expired::Rtx => on_rtx_expiry(sock),
            Expired::Persist => on_persist_expiry(sock),
            Expired::Delack => output::send_ack(sock),
            Expired::TimeWait => {
                log::debug!(target: "tcp", "TIME_WAIT expired, dropping socket");
                sock.inner.lock().state = TcpState::Closed;
                uninstall(sock);
            }
        }
    }
}

/// Retransmission timeout: either give up (the retry budget is spent and
/// the peer window is open, so the peer is simply gone) or collapse the
/// congestion window, roll `SND.NXT` back to `SND.UNA`, back off, and
/// force a send pass.
fn on_rtx_expiry(sock: &Arc<Socket>) {
    let action = {
        let mut s = sock.inner.lock();

        if s.rtx_count >= MAX_RTX && s.snd_wnd > 0 {
            log::warn!(target: "tcp", "{}:{}: retransmission limit, giving up",
                s.remote_ip, s.remote_port);
            s.timeout = true;
            s.state = TcpState::Closed;
            RtxAction::GiveUp
        } else {
            match s.state {
                TcpState::SynSent => {
                    s.rtx_count += 1;
                    s.rtx.backoff += 1;
                    s.rtx.time = (SYN_TIMEOUT << s.rtx.backoff.min(4)).min(RTO_MAX);
                    if s.rtx_count > MAX_RTX / 2 {
                        s.timeout = true;
                        s.state = TcpState::Closed;
                        RtxAction::GiveUp
                    } else {
                        RtxAction::ResendSyn(false)
                    }
                }
                TcpState::SynRcvd => {
                    s.rtx_count += 1;
                    s.rtx.backoff += 1;
                    s.rtx.time = (SYN_TIMEOUT << s.rtx.backoff.min(4)).min(RTO_MAX);
                    if s.rtx_count > MAX_RTX / 2 {
                        s.state = TcpState::Closed;
                        RtxAction::GiveUp
                    } else {
                        RtxAction::ResendSyn(true)
                    }
                }
                _ => {
                    // Go-back-N: collapse cwnd, rewind, and resend.
                    let smss = s.smss as u32;
                    s.ssthresh = (s.flight_size() / 2).max(2 * smss);
                    s.cwnd = IW * smss;
                    s.ack_count = 0;
                    s.dupacks = 0;
                    s.snd_nxt = s.snd_una;
                    if s.fin_sent && seq_lte(s.snd_una, s.fin_seq) {
                        // The FIN rolled back too; it must be re-emitted.
                        s.fin_sent = false;
                        s.state = match s.state {
                            TcpState::LastAck => TcpState::CloseWait,
                            TcpState::FinWait1 | TcpState::Closing => TcpState::Established,
                            other => other,
                        };
                    }
                    s.rtx_count += 1;
                    s.rtx.backoff += 1;
                    s.rtx.time = s.rto_current();
                    s.timed_seq = None; // Karn: no timing across retransmits
                    RtxAction::Resend
                }
            }
        }
    };

    match action {
        RtxAction::GiveUp => uninstall(sock),
        RtxAction::ResendSyn(synack) => {
            // send_syn re-arms nothing here: the timer above was re-set.
            output::send_syn(sock, synack);
        }
        RtxAction::Resend => output::trigger_send(sock, true),
    }
}

enum RtxAction {
    GiveUp,
    ResendSyn(bool),
    Resend,
}

/// Persist expiry: transmit a single byte into the closed window, then
/// back off and re-arm.
fn on_persist_expiry(sock: &Arc<Socket>) {
    {
        let mut s = sock.inner.lock();
        let has_data = s.send_buf.len() as u32 > s.snd_nxt.wrapping_sub(s.snd_una);
        if s.snd_wnd > 0 || !has_data {
            // Window opened (or nothing left to probe with) in the
            // meantime; the regular send path takes over.
            s.persist = Default::default();
            if s.snd_wnd > 0 {
                drop(s);
                output::trigger_send(sock, false);
            }
            return;
        }
        s.persist.backoff += 1;
        s.persist.time = (s.rto_current() << s.persist.backoff.min(6)).min(RTO_MAX);
    }
    output::retransmit_head(sock, true);
}

/// Flush a pending delayed ACK immediately (window updates after a read).
pub fn flush_delack(sock: &Arc<Socket>) {
    let pending = {
        let s = sock.inner.lock();
        s.delack.time > 0
    };
    if pending {
        output::send_ack(sock);
    }
}

#[cfg(test)]
mod tests {
    use super::super::output::{make_segment, ACK};
    use super::super::sock::compute_win;
    use super::*;

    #[test]
    fn disarmed_timers_do_not_fire() {
        // Off-table socket so this does not perturb the global list.
        let state = super::super::sock::SockState::new();
        let sock = Arc::new(Socket::new(0, state));
        // A tick over a fresh socket must not touch anything.
        run_timers(&sock);
        let s = sock.inner.lock();
        assert_eq!(s.rtx.time, 0);
        assert_eq!(s.persist.time, 0);
    }

    #[test]
    fn make_segment_reports_window_from_state() {
        let mut state = super::super::sock::SockState::new();
        state.rcv_nxt = 100;
        let win = compute_win(&mut state);
        let out = make_segment(&state, 1, ACK, win, None, &[]);
        // Window field sits at bytes 14..16 of the TCP header.
        let w = u16::from_be_bytes([out.segment[14], out.segment[15]]);
        assert_eq!(w, win);
    }
}
