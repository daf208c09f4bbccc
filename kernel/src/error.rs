//! Kernel-wide error codes.
//!
//! Every fallible kernel operation returns `Result<T, Errno>`. At the
//! syscall boundary the error is flattened to its negative integer code.

/// Kernel error codes, modeled after the classic POSIX errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Operation not permitted.
    Perm,
    /// No such file or directory.
    NoEnt,
    /// No such process.
    Srch,
    /// Interrupted system call (signal delivered while blocked).
    Intr,
    /// I/O error from a disk or controller.
    Io,
    /// No child processes to wait for.
    Child,
    /// Resource temporarily unavailable (nonblocking not ready).
    Again,
    /// Out of memory (allocator exhaustion).
    NoMem,
    /// Device or resource busy.
    Busy,
    /// File exists.
    Exist,
    /// No such device (invalid major/minor).
    NoDev,
    /// Not a directory.
    NotDir,
    /// Is a directory.
    IsDir,
    /// Invalid argument (bad arguments, partition overflow).
    Inval,
    /// No space left on device (bitmap exhausted with 0 bytes written).
    NoSpc,
    /// Broken pipe (send on a closed side).
    Pipe,
    /// Too many links.
    MLink,
    /// Directory not empty.
    NotEmpty,
    /// Address family not supported.
    AfNoSupport,
    /// Address already in use.
    AddrInUse,
    /// Cannot assign requested address.
    AddrNotAvail,
    /// Network is unreachable.
    NetUnreach,
    /// Connection reset by peer.
    ConnReset,
    /// Socket is already connected.
    IsConn,
    /// Socket is not connected.
    NotConn,
    /// Connection timed out.
    TimedOut,
    /// Connection refused.
    ConnRefused,
}

impl Errno {
    /// The negative integer code returned from syscalls.
    pub fn code(self) -> i32 {
        let v: i32 = match self {
            Errno::Perm => 1,
            Errno::NoEnt => 2,
            Errno::Srch => 3,
            Errno::Intr => 4,
            Errno::Io => 5,
            Errno::Child => 10,
            Errno::Again => 11,
            Errno::NoMem => 12,
            Errno::Busy => 16,
            Errno::Exist => 17,
            Errno::NoDev => 19,
            Errno::NotDir => 20,
            Errno::IsDir => 21,
            Errno::Inval => 22,
            Errno::NoSpc => 28,
            Errno::MLink => 31,
            Errno::Pipe => 32,
            Errno::NotEmpty => 39,
            Errno::AfNoSupport => 97,
            Errno::AddrInUse => 98,
            Errno::AddrNotAvail => 99,
            Errno::NetUnreach => 101,
            Errno::ConnReset => 104,
            Errno::IsConn => 106,
            Errno::NotConn => 107,
            Errno::TimedOut => 110,
            Errno::ConnRefused => 111,
        };
        -v
    }

    /// Short symbolic name ("EIO", "ENOSPC", ...).
    pub fn name(self) -> &'static str {
        match self {
            Errno::Perm => "EPERM",
            Errno::NoEnt => "ENOENT",
            Errno::Srch => "ESRCH",
            Errno::Intr => "EINTR",
            Errno::Io => "EIO",
            Errno::Child => "ECHILD",
            Errno::Again => "EAGAIN",
            Errno::NoMem => "ENOMEM",
            Errno::Busy => "EBUSY",
            Errno::Exist => "EEXIST",
            Errno::NoDev => "ENODEV",
            Errno::NotDir => "ENOTDIR",
            Errno::IsDir => "EISDIR",
            Errno::Inval => "EINVAL",
            Errno::NoSpc => "ENOSPC",
            Errno::Pipe => "EPIPE",
            Errno::MLink => "EMLINK",
            Errno::NotEmpty => "ENOTEMPTY",
            Errno::AfNoSupport => "EAFNOSUPPORT",
            Errno::AddrInUse => "EADDRINUSE",
            Errno::AddrNotAvail => "EADDRNOTAVAIL",
            Errno::NetUnreach => "ENETUNREACH",
            Errno::ConnReset => "ECONNRESET",
            Errno::IsConn => "EISCONN",
            Errno::NotConn => "ENOTCONN",
            Errno::TimedOut => "ETIMEDOUT",
            Errno::ConnRefused => "ECONNREFUSED",
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            Errno::Perm, Errno::NoEnt, Errno::Srch, Errno::Intr, Errno::Io,
            Errno::Child, Errno::Again, Errno::NoMem, Errno::Busy, Errno::Exist,
            Errno::NoDev, Errno::NotDir, Errno::IsDir, Errno::Inval, Errno::NoSpc,
            Errno::Pipe, Errno::MLink, Errno::NotEmpty, Errno::AfNoSupport,
            Errno::AddrInUse, Errno::AddrNotAvail, Errno::NetUnreach,
            Errno::ConnReset, Errno::IsConn, Errno::NotConn, Errno::TimedOut,
            Errno::ConnRefused,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
