//! Socket state: sequence variables, buffers, congestion and RTT state,
//! timers, and the window computations.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sync::Spinlock;
use crate::time;

use super::super::types::Ipv4Addr;

/// Send buffer capacity (power of two).
pub const SEND_BUF_SIZE: usize = 8192;
/// Receive buffer capacity (power of two).
pub const RECV_BUF_SIZE: usize = 8192;
/// Default maximum segment size, capped by the route MTU.
pub const DEFAULT_MSS: u16 = 1460;
/// Retransmission attempts before the connection times out.
pub const MAX_RTX: u32 = 8;
/// Initial congestion window in segments.
pub const IW: u32 = 2;
/// RTO bounds and bases, in 250 ms timer units.
pub const RTO_INIT: u32 = 4;
pub const RTO_MAX: u32 = 240;
pub const SYN_TIMEOUT: u32 = 20;
/// Maximum segment lifetime (TIME_WAIT lasts twice this).
pub const MSL: u32 = 120;
/// Delayed-ACK deadline.
pub const DELACK_TIME: u32 = 1;
/// Backlog ceiling per listener.
pub const MAX_BACKLOG: usize = 16;

// ── Sequence arithmetic (wrapping-safe, RFC 793) ────

pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_lte(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub fn seq_gte(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

/// Connection states per RFC 793.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// One countdown timer: `time` in 250 ms units (0 = disarmed), `backoff`
/// the exponential shift applied when re-arming.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTimer {
    pub time: u32,
    pub backoff: u32,
}

/// The mutable half of a socket, behind the per-socket lock.
pub struct SockState {
    pub state: TcpState,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,

    // Send sequence space.
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    /// Highest sequence ever sent (snd_nxt can roll back for go-back-N).
    pub snd_max: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    /// Largest window the peer has ever advertised.
    pub max_snd_wnd: u32,

    // Receive sequence space.
    pub rcv_nxt: u32,
    /// Right edge of the last advertised window; never moves left.
    pub adv_right_edge: u32,

    /// Bytes [snd_una, snd_una + len) awaiting acknowledgement.
    pub send_buf: VecDeque<u8>,
    /// In-sequence bytes awaiting the application.
    pub recv_buf: VecDeque<u8>,

    // Congestion control (RFC 5681).
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dupacks: u32,
    /// Byte accumulator for congestion avoidance.
    pub ack_count: u32,

    // RTT estimation (RFC 6298; srtt is stored scaled by 8).
    pub srtt: u32,
    pub rttvar: u32,
    pub rto: u32,
    /// Sequence being timed, if any (None while Karn's rule suppresses).
    pub timed_seq: Option<u32>,
    /// 250 ms ticks since the timed segment left.
    pub timed_ticks: u32,

    pub rtx: TcpTimer,
    pub persist: TcpTimer,
    pub delack: TcpTimer,
    pub time_wait: TcpTimer,
    pub rtx_count: u32,

    /// Send MSS (the peer's announcement, capped by the route MTU).
    pub smss: u16,
    /// Receive MSS (what we announce).
    pub rmss: u16,

    // Flags.
    pub closed: bool,
    pub eof: bool,
    pub epipe: bool,
    pub timeout: bool,
    pub fin_sent: bool,
    pub fin_seq: u32,
    pub refused: bool,
    pub reset: bool,

    /// Listener this socket was spawned from; cleared on accept.
    pub parent: Option<Arc<Socket>>,
    /// Pending and established children of a listener.
    pub backlog: Vec<Arc<Socket>>,
    pub backlog_max: usize,
}

/// A socket: its table slot plus the locked state. Reference counting is
/// the `Arc` around it; the table, a listener's backlog, and a child's
/// parent pointer each hold a strong reference.
pub struct Socket {
    pub index: usize,
    pub(crate) inner: Spinlock<SockState>,
}

impl Socket {
    pub(crate) fn new(index: usize, state: SockState) -> Socket {
        Socket { index, inner: Spinlock::new(state) }
    }
}

/// Initial send sequence: tick counter scrambled per connection.
fn generate_iss() -> u32 {
    use core::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let c = COUNTER.fetch_add(1, Ordering::Relaxed);
    (time::current_ticks() as u32)
        .wrapping_mul(2654435761)
        .wrapping_add(c.wrapping_mul(64007))
}

impl SockState {
    pub fn new() -> SockState {
        let iss = generate_iss();
        SockState {
            state: TcpState::Closed,
            local_ip: Ipv4Addr::ZERO,
            local_port: 0,
            remote_ip: Ipv4Addr::ZERO,
            remote_port: 0,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_max: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            max_snd_wnd: 0,
            rcv_nxt: 0,
            adv_right_edge: 0,
            send_buf: VecDeque::new(),
            recv_buf: VecDeque::new(),
            cwnd: IW * DEFAULT_MSS as u32,
            ssthresh: 0x0010_0000,
            dupacks: 0,
            ack_count: 0,
            srtt: 0,
            rttvar: 0,
            rto: RTO_INIT,
            timed_seq: None,
            timed_ticks: 0,
            rtx: TcpTimer::default(),
            persist: TcpTimer::default(),
            delack: TcpTimer::default(),
            time_wait: TcpTimer::default(),
            rtx_count: 0,
            smss: DEFAULT_MSS,
            rmss: DEFAULT_MSS,
            closed: false,
            eof: false,
            epipe: false,
            timeout: false,
            fin_sent: false,
            fin_seq: 0,
            refused: false,
            reset: false,
            parent: None,
            backlog: Vec::new(),
            backlog_max: MAX_BACKLOG,
        }
    }

    /// Bytes in flight: sent but not yet acknowledged.
    pub fn flight_size(&self) -> u32 {
        self.snd_max.wrapping_sub(self.snd_una)
    }

    /// Effective send window: the smaller of the peer's window and cwnd.
    pub fn effective_wnd(&self) -> u32 {
        if crate::config::tcp_disable_cc() {
            self.snd_wnd
        } else {
            self.snd_wnd.min(self.cwnd)
        }
    }

    /// Current RTO for data, with exponential backoff, capped.
    pub fn rto_current(&self) -> u32 {
        (self.rto << self.rtx.backoff.min(10)).clamp(RTO_INIT, RTO_MAX)
    }

    /// Fold an RTT sample `r` (250 ms units) into the estimator.
    pub fn update_rtt(&mut self, r: u32) {
        if self.srtt == 0 {
            self.srtt = 8 * r;
            self.rttvar = self.srtt / 2;
        } else {
            let delta = (8 * r) as i32 - self.srtt as i32;
            self.srtt = (self.srtt as i32 + delta / 8).max(1) as u32;
            let adj = delta.unsigned_abs() / 4;
            self.rttvar = self.rttvar - self.rttvar / 4 + adj / 4;
        }
        self.rto = ((self.srtt + (4 * self.rttvar).max(8)) / 8).clamp(RTO_INIT, RTO_MAX);
    }
}

/// Receive window to advertise, with silly-window avoidance: never less
/// than one MSS (zero instead), and the right edge never moves left.
/// Mutates `adv_right_edge`.
pub fn compute_win(s: &mut SockState) -> u16 {
    let avail = RECV_BUF_SIZE - s.recv_buf.len();
    let mut win = if avail < s.rmss as usize { 0 } else { avail as u32 };

    let edge = s.rcv_nxt.wrapping_add(win);
    if seq_lt(edge, s.adv_right_edge) {
        win = s.adv_right_edge.wrapping_sub(s.rcv_nxt);
    } else {
        s.adv_right_edge = edge;
    }
    win.min(65535) as u16
}

/// The window [`compute_win`] would advertise, without mutating anything.
pub fn compute_win_peek(s: &SockState) -> u16 {
    let avail = RECV_BUF_SIZE - s.recv_buf.len();
    let mut win = if avail < s.rmss as usize { 0 } else { avail as u32 };
    let edge = s.rcv_nxt.wrapping_add(win);
    if seq_lt(edge, s.adv_right_edge) {
        win = s.adv_right_edge.wrapping_sub(s.rcv_nxt);
    }
    win.min(65535) as u16
}

/// Ephemeral port allocator (49152..=65535, wrapping).
pub fn alloc_ephemeral_port() -> u16 {
    use core::sync::atomic::{AtomicU16, Ordering};
    static NEXT: AtomicU16 = AtomicU16::new(49152);
    loop {
        let p = NEXT.fetch_add(1, Ordering::Relaxed);
        if p >= 49152 {
            return p;
        }
        NEXT.store(49152, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_lt(0xFFFF_FFF0, 0x10));
        assert!(seq_gt(0x10, 0xFFFF_FFF0));
        assert!(seq_lte(5, 5));
        assert!(seq_gte(5, 5));
        assert!(!seq_lt(5, 5));
    }

    #[test]
    fn rtt_estimator_follows_rfc6298() {
        let mut s = SockState::new();
        // First sample r = 4 (1 s): srtt = 32, rttvar = 16,
        // rto = (32 + 64) / 8 = 12.
        s.update_rtt(4);
        assert_eq!(s.srtt, 32);
        assert_eq!(s.rttvar, 16);
        assert_eq!(s.rto, 12);

        // A stream of identical samples converges rttvar downward.
        for _ in 0..50 {
            s.update_rtt(4);
        }
        assert_eq!(s.srtt, 32);
        assert!(s.rttvar <= 1);
        assert!(s.rto >= RTO_INIT, "RTO is clamped at the floor");
    }

    #[test]
    fn rto_stays_inside_the_clamp() {
        let mut s = SockState::new();
        s.update_rtt(0); // absurdly fast sample
        assert!(s.rto >= RTO_INIT);
        let mut s2 = SockState::new();
        s2.update_rtt(10_000); // absurdly slow sample
        assert!(s2.rto <= RTO_MAX);
    }

    #[test]
    fn window_avoids_silly_advertisements() {
        let mut s = SockState::new();
        s.rcv_nxt = 1000;
        s.rmss = 1460;

        // Plenty of space: the full buffer is advertised.
        assert_eq!(compute_win(&mut s), RECV_BUF_SIZE as u16);

        // Less than one MSS of space: advertise zero, not a sliver.
        s.recv_buf.extend(core::iter::repeat(0u8).take(RECV_BUF_SIZE - 100));
        s.adv_right_edge = s.rcv_nxt; // pretend everything was consumed
        assert_eq!(compute_win(&mut s), 0);
    }

    #[test]
    fn window_right_edge_never_retreats() {
        let mut s = SockState::new();
        s.rcv_nxt = 5000;
        s.rmss = 100;
        let w1 = compute_win(&mut s);
        assert_eq!(w1, RECV_BUF_SIZE as u16);
        let edge = s.adv_right_edge;

        // Buffer fills up without rcv_nxt advancing: the previously
        // promised edge must hold.
        s.recv_buf.extend(core::iter::repeat(0u8).take(RECV_BUF_SIZE / 2));
        let w2 = compute_win(&mut s);
        assert_eq!(
            s.rcv_nxt.wrapping_add(w2 as u32),
            edge,
            "edge held even though space shrank"
        );
        assert_eq!(s.adv_right_edge, edge);
    }
}
