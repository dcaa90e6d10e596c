//! 9P error representations.
//!
//! 9P2000 reports errors as strings (`Rerror.ename`); POSIX errno values
//! are not part of the wire protocol. [`Error`] keeps both: an errno for
//! callers that want to branch on error kind, and the textual message
//! that actually crosses the wire.

use std::{fmt, io};

use nix::errno::Errno;

fn errno_from_ioerror(e: &io::Error) -> Errno {
    use io::ErrorKind::*;
    e.raw_os_error().map(Errno::from_raw).unwrap_or(match e.kind() {
        NotFound => Errno::ENOENT,
        PermissionDenied => Errno::EPERM,
        ConnectionRefused => Errno::ECONNREFUSED,
        ConnectionReset => Errno::ECONNRESET,
        ConnectionAborted => Errno::ECONNABORTED,
        NotConnected => Errno::ENOTCONN,
        AddrInUse => Errno::EADDRINUSE,
        AddrNotAvailable => Errno::EADDRNOTAVAIL,
        BrokenPipe => Errno::EPIPE,
        AlreadyExists => Errno::EEXIST,
        WouldBlock => Errno::EAGAIN,
        InvalidInput | InvalidData => Errno::EINVAL,
        TimedOut => Errno::ETIMEDOUT,
        WriteZero => Errno::EAGAIN,
        Interrupted => Errno::EINTR,
        _ => Errno::EIO,
    })
}

/// A 9P-level error: an errno plus the text reported on the wire as `Rerror`.
///
/// `Display` yields the wire text; `errno()` yields the POSIX-ish
/// classification used by callers that want to match on error kind.
#[derive(Debug, Clone)]
pub enum Error {
    /// A protocol-level error detected by the codec or server loop
    /// (malformed frame, oversized walk, unknown fid, ...). Fatal to the
    /// connection unless explicitly recovered at the request layer.
    Protocol(String),
    /// A semantic or backend error with an explicit errno and message,
    /// e.g. "file not found" / ENOENT.
    No(Errno, String),
    /// Wraps a lower-level I/O error.
    Io(String, Errno),
}

impl Error {
    pub fn no(errno: Errno, msg: impl Into<String>) -> Error {
        Error::No(errno, msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }

    /// Errno classification for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Protocol(_) => Errno::EPROTO,
            Error::No(e, _) => *e,
            Error::Io(_, e) => *e,
        }
    }

    /// The text that should be sent as `Rerror.ename`.
    pub fn wire_message(&self) -> String {
        match self {
            Error::Protocol(m) => m.clone(),
            Error::No(_, m) => m.clone(),
            Error::Io(m, _) => m.clone(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_message())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let errno = errno_from_ioerror(&e);
        Error::Io(e.to_string(), errno)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::No(e, e.desc().to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::No(e, e.desc().to_string())
    }
}

/// Re-exported errno constants, so callers can write `errno::ENOENT`
/// without depending on `nix` directly.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// 9P2000 wire error strings.
///
/// Lifted from the Plan 9 `error.c` table (the same table
/// `original_source`'s C implementation and Linux's `net/9p/error.c`
/// both draw from); used as canned `Rerror.ename` text for the handful
/// of errors the protocol itself defines, as opposed to backend-specific
/// messages which are free text.
pub mod string {
    pub const EPERM: &str = "Operation not permitted";
    pub const ENOENT: &str = "No such file or directory";
    pub const EIO: &str = "Input/output error";
    pub const EBADF: &str = "Bad file descriptor";
    pub const EEXIST: &str = "File exists";
    pub const ENOTDIR: &str = "Not a directory";
    pub const EISDIR: &str = "Is a directory";
    pub const EINVAL: &str = "Invalid argument";
    pub const ENOTEMPTY: &str = "Directory not empty";
    pub const EROFS: &str = "Read-only file system";
    pub const ENAMETOOLONG: &str = "File name too long";
    pub const EPROTO: &str = "Protocol error";
    pub const EOPNOTSUPP: &str = "Operation not supported";
    pub const ESPIPE: &str = "bad offset in directory read";
    pub const EBADF_FID: &str = "fid unknown or out of range";
    pub const EBADF_INUSE: &str = "fid already in use";
    pub const ENOENT_PATH: &str = "illegal path element";
    pub const EACCES_ESCAPE: &str = "path escapes root";
    pub const ENOENT_FILE: &str = "file not found";
    pub const AUTH_NOT_REQUIRED: &str = "authentication not required";
    pub const AUTH_REQUIRED: &str = "authentication required";
    pub const AUTH_CONV_EXPIRED: &str = "auth: conversation expired";
    pub const AUTH_NO_CREDENTIAL: &str = "auth: no credential found for protocol";
}
