//! 9P error representations.
//!
//! 9P2000 errors are a single descriptive string (`Rerror`). The 9P2000.u
//! extension appends a numeric errno after that string, so every error this
//! crate produces carries both: a [`nix::errno::Errno`] the `.u` dialect can
//! serialize directly, and a string the plain dialect falls back to.

use std::io;
use std::io::ErrorKind::*;

use crate::error::errno::*;

fn errno_from_ioerror(e: &io::Error) -> nix::errno::Errno {
    e.raw_os_error().map(nix::errno::from_i32).unwrap_or(match e.kind() {
        NotFound => ENOENT,
        PermissionDenied => EPERM,
        ConnectionRefused => ECONNREFUSED,
        ConnectionReset => ECONNRESET,
        ConnectionAborted => ECONNABORTED,
        NotConnected => ENOTCONN,
        AddrInUse => EADDRINUSE,
        AddrNotAvailable => EADDRNOTAVAIL,
        BrokenPipe => EPIPE,
        AlreadyExists => EALREADY,
        WouldBlock => EAGAIN,
        InvalidInput => EINVAL,
        InvalidData => EINVAL,
        TimedOut => ETIMEDOUT,
        WriteZero => EAGAIN,
        Interrupted => EINTR,
        _ => EIO,
    })
}

/// 9P error type, convertible to an errno (for `.u`) and to a descriptive
/// string (for plain 9P2000).
#[derive(Debug)]
pub enum Error {
    /// A system error carrying an errno.
    No(nix::errno::Errno),
    /// An I/O error from the transport or backend storage.
    Io(io::Error),
    /// A core protocol violation: malformed frame, duplicate tag, and the
    /// like. Always fatal to the connection; never becomes an `Rerror`.
    Protocol(&'static str),
    /// A well-formed message of a recognized but undispatched type (the
    /// 9P2000.L set). Non-fatal: becomes `Rerror("not implemented")` and the
    /// connection continues (spec §7 *UnknownMessageType*, reference
    /// behavior).
    Unimplemented,
    /// A fid the backend or core could not find bound. Reported verbatim as
    /// `Rerror("Bad fid!")` rather than the generic `EBADF` string.
    BadFid,
    /// `Twalk` of a non-empty `wname` sequence found no matching prefix.
    /// Reported verbatim as `Rerror("No such file!")`.
    NoSuchFile,
    /// `Twstat` tried to change a stat's file-type bits through `merge`.
    ModeConflict,
}

impl Error {
    /// Get an errno representation, used to populate `.u`'s `Rerror` errno
    /// field and to pick a string via [`string::strerror`].
    pub fn errno(&self) -> nix::errno::Errno {
        match self {
            Error::No(e) => *e,
            Error::Io(e) => errno_from_ioerror(e),
            Error::Protocol(_) => EIO,
            Error::Unimplemented => ENOSYS,
            Error::BadFid => EBADF,
            Error::NoSuchFile => ENOENT,
            Error::ModeConflict => EINVAL,
        }
    }

    /// True if this error must close the connection rather than produce an
    /// `Rerror` reply (spec §7: *MalformedFrame*, *Truncated*, *Overflow*,
    /// *DuplicateTag*).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::No(e) => write!(f, "{}", string::strerror(*e)),
            Error::Io(e) => write!(f, "{}", e),
            Error::Protocol(msg) => write!(f, "{}", msg),
            Error::Unimplemented => write!(f, "{}", string::NOT_IMPLEMENTED),
            Error::BadFid => write!(f, "{}", string::BAD_FID),
            Error::NoSuchFile => write!(f, "{}", string::NO_SUCH_FILE),
            Error::ModeConflict => write!(f, "Wstat may not change a file's type"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::No(e)
    }
}

/// Re-export of `nix`'s errno constants, so callers can write
/// `error::Error::No(error::errno::ENOENT)` without naming `nix` directly.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// 9P2000 error strings, as used by the plain dialect's `Rerror`.
///
/// Taken from the standard Plan 9 `error.c` table (the same strings the
/// Linux v9fs client's `errstr2errno` maps back from).
pub mod string {
    use nix::errno::Errno;

    pub const EPERM: &str = "Operation not permitted";
    pub const ENOENT: &str = "No such file or directory";
    pub const EINTR: &str = "Interrupted system call";
    pub const EIO: &str = "Input/output error";
    pub const ENXIO: &str = "No such device or address";
    pub const E2BIG: &str = "Argument list too long";
    pub const EBADF: &str = "Bad file descriptor";
    pub const EAGAIN: &str = "Resource temporarily unavailable";
    pub const ENOMEM: &str = "Cannot allocate memory";
    pub const EACCES: &str = "Permission denied";
    pub const EFAULT: &str = "Bad address";
    pub const EBUSY: &str = "Device or resource busy";
    pub const EEXIST: &str = "File exists";
    pub const EXDEV: &str = "Invalid cross-device link";
    pub const ENODEV: &str = "No such device";
    pub const ENOTDIR: &str = "Not a directory";
    pub const EISDIR: &str = "Is a directory";
    pub const EINVAL: &str = "Invalid argument";
    pub const ENFILE: &str = "Too many open files in system";
    pub const EMFILE: &str = "Too many open files";
    pub const EFBIG: &str = "File too large";
    pub const ENOSPC: &str = "No space left on device";
    pub const ESPIPE: &str = "Illegal seek";
    pub const EROFS: &str = "Read-only file system";
    pub const EMLINK: &str = "Too many links";
    pub const EPIPE: &str = "Broken pipe";
    pub const ENAMETOOLONG: &str = "File name too long";
    pub const ENOLCK: &str = "No locks available";
    pub const ENOSYS: &str = "Function not implemented";
    pub const ENOTEMPTY: &str = "Directory not empty";
    pub const ELOOP: &str = "Too many levels of symbolic links";
    pub const ENODATA: &str = "No data available";
    pub const EPROTO: &str = "Protocol error";
    pub const EBADMSG: &str = "Bad message";
    pub const ENOTSOCK: &str = "Socket operation on non-socket";
    pub const EMSGSIZE: &str = "Message too long";
    pub const EPROTONOSUPPORT: &str = "Protocol not supported";
    pub const EOPNOTSUPP: &str = "Operation not supported";
    pub const ECONNABORTED: &str = "Software caused connection abort";
    pub const ECONNRESET: &str = "Connection reset by peer";
    pub const ENOBUFS: &str = "No buffer space available";
    pub const ENOTCONN: &str = "Transport endpoint is not connected";
    pub const ETIMEDOUT: &str = "Connection timed out";
    pub const ECONNREFUSED: &str = "Connection refused";
    pub const EALREADY: &str = "Operation already in progress";
    pub const EINPROGRESS: &str = "Operation now in progress";
    pub const EADDRINUSE: &str = "Address already in use";
    pub const EADDRNOTAVAIL: &str = "Cannot assign requested address";

    /// Walk's "no such element in the prefix" error (spec §4.C, §8 scenario 3).
    pub const NO_SUCH_FILE: &str = "No such file!";
    /// The core's catch-all for a backend FID that isn't bound.
    pub const BAD_FID: &str = "Bad fid!";
    /// `UnknownMessageType` (spec §7).
    pub const NOT_IMPLEMENTED: &str = "not implemented";

    /// Map an errno to its descriptive 9P2000 string. Falls back to
    /// [`EIO`] for anything not in the standard table.
    pub fn strerror(errno: Errno) -> &'static str {
        match errno {
            Errno::EPERM => EPERM,
            Errno::ENOENT => ENOENT,
            Errno::EINTR => EINTR,
            Errno::EIO => EIO,
            Errno::ENXIO => ENXIO,
            Errno::E2BIG => E2BIG,
            Errno::EBADF => EBADF,
            Errno::EAGAIN => EAGAIN,
            Errno::ENOMEM => ENOMEM,
            Errno::EACCES => EACCES,
            Errno::EFAULT => EFAULT,
            Errno::EBUSY => EBUSY,
            Errno::EEXIST => EEXIST,
            Errno::EXDEV => EXDEV,
            Errno::ENODEV => ENODEV,
            Errno::ENOTDIR => ENOTDIR,
            Errno::EISDIR => EISDIR,
            Errno::EINVAL => EINVAL,
            Errno::ENFILE => ENFILE,
            Errno::EMFILE => EMFILE,
            Errno::EFBIG => EFBIG,
            Errno::ENOSPC => ENOSPC,
            Errno::ESPIPE => ESPIPE,
            Errno::EROFS => EROFS,
            Errno::EMLINK => EMLINK,
            Errno::EPIPE => EPIPE,
            Errno::ENAMETOOLONG => ENAMETOOLONG,
            Errno::ENOLCK => ENOLCK,
            Errno::ENOSYS => ENOSYS,
            Errno::ENOTEMPTY => ENOTEMPTY,
            Errno::ELOOP => ELOOP,
            Errno::ENODATA => ENODATA,
            Errno::EPROTO => EPROTO,
            Errno::EBADMSG => EBADMSG,
            Errno::ENOTSOCK => ENOTSOCK,
            Errno::EMSGSIZE => EMSGSIZE,
            Errno::EPROTONOSUPPORT => EPROTONOSUPPORT,
            Errno::EOPNOTSUPP => EOPNOTSUPP,
            Errno::ECONNABORTED => ECONNABORTED,
            Errno::ECONNRESET => ECONNRESET,
            Errno::ENOBUFS => ENOBUFS,
            Errno::ENOTCONN => ENOTCONN,
            Errno::ETIMEDOUT => ETIMEDOUT,
            Errno::ECONNREFUSED => ECONNREFUSED,
            Errno::EALREADY => EALREADY,
            Errno::EINPROGRESS => EINPROGRESS,
            Errno::EADDRINUSE => EADDRINUSE,
            Errno::EADDRNOTAVAIL => EADDRNOTAVAIL,
            _ => EIO,
        }
    }
}
