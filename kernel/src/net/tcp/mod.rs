//! TCP: connection state machines, sliding-window transfer with RFC 5681
//! congestion control and RFC 6298 retransmission timing, delayed ACKs,
//! zero-window persist probing, and silly-window-syndrome avoidance.
//!
//! Out-of-order segments are discarded (no reassembly queue); urgent
//! data, SACK, window scaling, and timestamps are not implemented. MSS is
//! the only option emitted or honored.
//!
//! Module structure:
//! - `sock`   — socket state, sequence arithmetic, windows, RTT estimator
//! - `output` — segment construction and the send engine (`trigger_send`)
//! - `input`  — the RFC 793 "segment arrives" state machine
//! - `timer`  — the 250 ms tick driving rtx / persist / delack / TIME_WAIT

pub mod input;
pub mod output;
pub mod sock;
pub mod timer;

#[cfg(test)]
mod tests;

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Errno;
use crate::sync::Spinlock;

use sock::{SockState, Socket, TcpState};

use super::types::Ipv4Addr;

/// Socket table slots.
pub const MAX_SOCKETS: usize = 64;

/// Global socket list. The list lock is never held while a socket's own
/// lock is held: timer and input paths snapshot `Arc` clones first, then
/// lock sockets one at a time.
static SOCKETS: Spinlock<Vec<Option<Arc<Socket>>>> = Spinlock::new(Vec::new());

// ── Stack-wide counters ─────────────────────────────

pub static ACTIVE_OPENS: AtomicU64 = AtomicU64::new(0);
pub static PASSIVE_OPENS: AtomicU64 = AtomicU64::new(0);
pub static SEGMENTS_SENT: AtomicU64 = AtomicU64::new(0);
pub static SEGMENTS_RECV: AtomicU64 = AtomicU64::new(0);
pub static RETRANSMITS: AtomicU64 = AtomicU64::new(0);
pub static RESETS_SENT: AtomicU64 = AtomicU64::new(0);

pub(crate) fn with_table<R>(f: impl FnOnce(&mut Vec<Option<Arc<Socket>>>) -> R) -> R {
    let mut table = SOCKETS.lock();
    if table.is_empty() {
        table.resize_with(MAX_SOCKETS, || None);
    }
    f(&mut table)
}

/// Install a socket in a free slot.
pub(crate) fn install(state: SockState) -> Result<Arc<Socket>, Errno> {
    with_table(|table| {
        let slot = table.iter().position(|s| s.is_none()).ok_or(Errno::Again)?;
        let sock = Arc::new(Socket::new(slot, state));
        table[slot] = Some(Arc::clone(&sock));
        Ok(sock)
    })
}

/// Drop a socket from the table and sever its parent/backlog links.
pub(crate) fn uninstall(sock: &Arc<Socket>) {
    let (parent, backlog) = {
        let mut s = sock.inner.lock();
        (s.parent.take(), core::mem::take(&mut s.backlog))
    };
    if let Some(parent) = parent {
        parent.inner.lock().backlog.retain(|c| c.index != sock.index);
    }
    for child in backlog {
        child.inner.lock().parent = None;
    }
    with_table(|table| {
        if table[sock.index].as_ref().is_some_and(|s| Arc::ptr_eq(s, sock)) {
            table[sock.index] = None;
        }
    });
}

/// Snapshot of every live socket (timer iteration, diagnostics).
pub(crate) fn snapshot() -> Vec<Arc<Socket>> {
    with_table(|table| table.iter().flatten().cloned().collect())
}

/// Socket lookup for an incoming segment: longest match on the quadruple,
/// with `(INADDR_ANY, 0)` wildcards allowed only on listeners.
pub(crate) fn lookup(
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
) -> Option<Arc<Socket>> {
    let sockets = snapshot();

    // Exact quadruple first.
    for sock in &sockets {
        let s = sock.inner.lock();
        if s.state != TcpState::Listen
            && s.local_port == local_port
            && s.remote_port == remote_port
            && s.remote_ip == remote_ip
            && (s.local_ip == local_ip || s.local_ip == Ipv4Addr::ZERO)
        {
            return Some(Arc::clone(sock));
        }
    }

    // Listeners: prefer an exact local address over the wildcard.
    let mut wildcard = None;
    for sock in &sockets {
        let s = sock.inner.lock();
        if s.state != TcpState::Listen || s.local_port != local_port {
            continue;
        }
        if s.local_ip == local_ip {
            return Some(Arc::clone(sock));
        }
        if s.local_ip == Ipv4Addr::ZERO && wildcard.is_none() {
            wildcard = Some(Arc::clone(sock));
        }
    }
    wildcard
}

// ── Public socket API ───────────────────────────────

/// Active open. Emits the SYN and returns the socket immediately; poll
/// [`status`] or use [`connect_wait`] for completion.
pub fn connect(remote_ip: Ipv4Addr, remote_port: u16) -> Result<Arc<Socket>, Errno> {
    if remote_port == 0 || remote_ip == Ipv4Addr::ZERO {
        return Err(Errno::AddrNotAvail);
    }
    let (dev, _) = super::ip::route(remote_ip).ok_or(Errno::NetUnreach)?;
    let mss_cap = (dev.mtu - 40) as u16;

    let mut state = SockState::new();
    state.local_ip = dev.ip;
    state.local_port = sock::alloc_ephemeral_port();
    state.remote_ip = remote_ip;
    state.remote_port = remote_port;
    state.smss = state.smss.min(mss_cap);
    state.rmss = state.rmss.min(mss_cap);
    state.state = TcpState::SynSent;

    let sock = install(state)?;
    ACTIVE_OPENS.fetch_add(1, Ordering::Relaxed);
    output::send_syn(&sock, false);
    Ok(sock)
}

/// Block (spin-poll) until the connection settles or `timeout_ticks`
/// elapses.
pub fn connect_wait(sock: &Arc<Socket>, timeout_ticks: u64) -> Result<(), Errno> {
    let start = crate::time::current_ticks();
    loop {
        {
            let s = sock.inner.lock();
            match s.state {
                TcpState::Established => return Ok(()),
                TcpState::Closed => {
                    return Err(if s.refused {
                        Errno::ConnRefused
                    } else if s.timeout {
                        Errno::TimedOut
                    } else {
                        Errno::ConnReset
                    });
                }
                _ => {}
            }
        }
        if crate::time::ticks_since(start) >= timeout_ticks {
            return Err(Errno::TimedOut);
        }
        core::hint::spin_loop();
    }
}

/// Passive open on `(local_ip, port)`; `local_ip` may be `ZERO` for any.
pub fn listen(local_ip: Ipv4Addr, port: u16, backlog: usize) -> Result<Arc<Socket>, Errno> {
    if port == 0 {
        return Err(Errno::Inval);
    }
    let clash = snapshot().into_iter().any(|sock| {
        let s = sock.inner.lock();
        s.state == TcpState::Listen
            && s.local_port == port
            && (s.local_ip == local_ip || s.local_ip == Ipv4Addr::ZERO || local_ip == Ipv4Addr::ZERO)
    });
    if clash {
        return Err(Errno::AddrInUse);
    }

    let mut state = SockState::new();
    state.local_ip = local_ip;
    state.local_port = port;
    state.state = TcpState::Listen;
    state.backlog_max = backlog.clamp(1, sock::MAX_BACKLOG);
    install(state)
}

/// Take one established connection off a listener's backlog, if any.
pub fn accept(listener: &Arc<Socket>) -> Result<Option<(Arc<Socket>, Ipv4Addr, u16)>, Errno> {
    let mut l = listener.inner.lock();
    if l.state != TcpState::Listen {
        return Err(Errno::Inval);
    }
    let ready = l
        .backlog
        .iter()
        .position(|c| c.inner.lock().state == TcpState::Established);
    let child = match ready {
        Some(i) => l.backlog.remove(i),
        None => return Ok(None),
    };
    drop(l);
    let (ip, port) = {
        let mut c = child.inner.lock();
        c.parent = None; // leaves the backlog: break the reference cycle
        (c.remote_ip, c.remote_port)
    };
    Ok(Some((child, ip, port)))
}

/// Queue bytes for transmission. Returns the number accepted (bounded by
/// send-buffer space); `EAGAIN` when the buffer is full.
pub fn send(sock: &Arc<Socket>, data: &[u8]) -> Result<usize, Errno> {
    let accepted = {
        let mut s = sock.inner.lock();
        if s.epipe || s.closed {
            return Err(Errno::Pipe);
        }
        match s.state {
            TcpState::Established | TcpState::CloseWait => {}
            TcpState::SynSent | TcpState::SynRcvd => return Err(Errno::Again),
            TcpState::Listen | TcpState::Closed => return Err(Errno::NotConn),
            _ => return Err(Errno::Pipe),
        }
        let space = sock::SEND_BUF_SIZE - s.send_buf.len();
        if space == 0 {
            return Err(Errno::Again);
        }
        let n = space.min(data.len());
        s.send_buf.extend(data[..n].iter().copied());
        n
    };
    output::trigger_send(sock, false);
    Ok(accepted)
}

/// Read received in-sequence bytes. Returns 0 at EOF (peer FIN and the
/// buffer drained); `EAGAIN` when nothing is available yet.
pub fn recv(sock: &Arc<Socket>, buf: &mut [u8]) -> Result<usize, Errno> {
    let (n, window_opened) = {
        let mut s = sock.inner.lock();
        if s.reset {
            return Err(Errno::ConnReset);
        }
        match s.state {
            TcpState::Listen => return Err(Errno::NotConn),
            TcpState::SynSent | TcpState::SynRcvd => return Err(Errno::Again),
            _ => {}
        }
        if s.recv_buf.is_empty() {
            if s.eof {
                return Ok(0);
            }
            if s.state == TcpState::Closed {
                return Err(Errno::NotConn);
            }
            return Err(Errno::Again);
        }
        let was_zero = sock::compute_win_peek(&s) == 0;
        let n = buf.len().min(s.recv_buf.len());
        for b in buf[..n].iter_mut() {
            *b = s.recv_buf.pop_front().unwrap();
        }
        (n, was_zero && sock::compute_win_peek(&s) > 0)
    };
    if window_opened {
        // The peer may be persist-probing a zero window: announce space.
        output::send_ack(sock);
    }
    Ok(n)
}

/// Close the sending side and, outside the synchronized states, the whole
/// socket.
pub fn close(sock: &Arc<Socket>) {
    let emit_fin = {
        let mut s = sock.inner.lock();
        match s.state {
            TcpState::Established | TcpState::SynRcvd | TcpState::CloseWait => {
                s.closed = true;
                s.epipe = true;
                true
            }
            _ => {
                s.state = TcpState::Closed;
                false
            }
        }
    };
    if emit_fin {
        output::trigger_send(sock, false);
    } else {
        uninstall(sock);
    }
}

/// Current connection state.
pub fn status(sock: &Arc<Socket>) -> TcpState {
    sock.inner.lock().state
}

/// One row of the connection listing.
pub struct ConnInfo {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub state: TcpState,
    pub recv_queued: usize,
    pub send_queued: usize,
}

/// Every live connection (a `netstat` feed).
pub fn list_connections() -> Vec<ConnInfo> {
    snapshot()
        .into_iter()
        .map(|sock| {
            let s = sock.inner.lock();
            ConnInfo {
                local_ip: s.local_ip,
                local_port: s.local_port,
                remote_ip: s.remote_ip,
                remote_port: s.remote_port,
                state: s.state,
                recv_queued: s.recv_buf.len(),
                send_queued: s.send_buf.len(),
            }
        })
        .collect()
}
