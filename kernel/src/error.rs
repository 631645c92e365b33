//! # Error Model
//!
//! Every fallible operation in cinder returns [`Result<T>`]. The error type
//! is a closed set of semantic kinds; user-visible formatting is
//! `"<message> (<hex code>)"`, and the shell maps errors into non-zero exit
//! codes.

use core::fmt;

/// Result type for all cinder operations
pub type Result<T> = core::result::Result<T, Error>;

/// Semantic error kinds
///
/// Transient network conditions are not errors: they are retried by the
/// governing retry timer and only surface as [`Error::TimedOut`] once the
/// retry ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A parameter or state was not acceptable
    InvalidArgument,
    /// Memory allocation failed
    NoMemory,
    /// The named entity does not exist
    NoSuchEntity,
    /// Operation has been started and is still in progress
    InProgress,
    /// Operation was cancelled by a shutdown upstream
    Cancelled,
    /// The retry ceiling was reached without success
    TimedOut,
    /// The peer reset the connection
    ConnectionReset,
    /// The peer refused the connection
    ConnectionRefused,
    /// No route to the destination network
    NetUnreachable,
    /// Authentication or authorization failed
    PermissionDenied,
    /// The peer violated the protocol
    Protocol,
    /// The operation is not supported (e.g. an unregistered URI scheme)
    NotSupported,
    /// The local address is already in use
    AddrInUse,
    /// The requested local address cannot be assigned
    AddrNotAvailable,
    /// A bounded queue or cache had no free slot
    NoBufs,
    /// The image cannot be executed
    NoExec,
    /// The operation would block (internal; never surfaced to scripts)
    WouldBlock,
    /// An opaque platform error (e.g. a UEFI status word)
    Platform(u32),
}

impl Error {
    /// Stable numeric code, used in user-visible messages and exit codes
    pub fn code(self) -> u32 {
        match self {
            Error::InvalidArgument => 0x1c00_0000,
            Error::NoMemory => 0x2200_0000,
            Error::NoSuchEntity => 0x2c00_0000,
            Error::InProgress => 0x1d00_0000,
            Error::Cancelled => 0x0b00_0000,
            Error::TimedOut => 0x4c00_0000,
            Error::ConnectionReset => 0x0f00_0000,
            Error::ConnectionRefused => 0x0e00_0000,
            Error::NetUnreachable => 0x2800_0000,
            Error::PermissionDenied => 0x0200_0000,
            Error::Protocol => 0x3c00_0000,
            Error::NotSupported => 0x3e00_0000,
            Error::AddrInUse => 0x0c00_0000,
            Error::AddrNotAvailable => 0x0d00_0000,
            Error::NoBufs => 0x2300_0000,
            Error::NoExec => 0x2500_0000,
            Error::WouldBlock => 0x1000_0000,
            Error::Platform(status) => 0x7f00_0000 | (status & 0x00ff_ffff),
        }
    }

    /// Message used in the single-line shell error report
    pub fn message(self) -> &'static str {
        match self {
            Error::InvalidArgument => "Invalid argument",
            Error::NoMemory => "Out of memory",
            Error::NoSuchEntity => "No such entity",
            Error::InProgress => "Operation in progress",
            Error::Cancelled => "Operation cancelled",
            Error::TimedOut => "Connection timed out",
            Error::ConnectionReset => "Connection reset",
            Error::ConnectionRefused => "Connection refused",
            Error::NetUnreachable => "Network unreachable",
            Error::PermissionDenied => "Permission denied",
            Error::Protocol => "Protocol error",
            Error::NotSupported => "Not supported",
            Error::AddrInUse => "Address in use",
            Error::AddrNotAvailable => "Address not available",
            Error::NoBufs => "No buffer space",
            Error::NoExec => "Not executable",
            Error::WouldBlock => "Resource temporarily unavailable",
            Error::Platform(_) => "Platform error",
        }
    }

    /// Exit code visible to scripts as `$?` (0 is reserved for success)
    pub fn exit_code(self) -> u32 {
        self.code() >> 24
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#010x})", self.message(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let all = [
            Error::InvalidArgument,
            Error::NoMemory,
            Error::NoSuchEntity,
            Error::InProgress,
            Error::Cancelled,
            Error::TimedOut,
            Error::ConnectionReset,
            Error::ConnectionRefused,
            Error::NetUnreachable,
            Error::PermissionDenied,
            Error::Protocol,
            Error::NotSupported,
            Error::AddrInUse,
            Error::AddrNotAvailable,
            Error::NoBufs,
            Error::NoExec,
            Error::WouldBlock,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn exit_codes_nonzero() {
        assert_ne!(Error::TimedOut.exit_code(), 0);
        assert_ne!(Error::Platform(0).exit_code(), 0);
    }

    #[test]
    fn display_format() {
        let s = alloc::format!("{}", Error::TimedOut);
        assert!(s.starts_with("Connection timed out ("));
        assert!(s.ends_with(')'));
    }
}
