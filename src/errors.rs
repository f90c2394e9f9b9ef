//! Utilities dealing with error handling in this crate.

use derive_more::From;
use failure::Fail;

/// Errors produced by this crate.
///
/// Per the crate's error taxonomy, most of these are fatal in practice (the
/// caller is expected to abort the process with a diagnostic rather than
/// retry); `AllocationFailed` is the one variant a caller can recover from by
/// surfacing a thread-create failure upward.
#[derive(Debug, Fail, From)]
pub enum Error {
    /// Errors originating from calls to `std::io::*`, including a short
    /// trace-file `open`.
    #[fail(display = "IO Error - {}", _0)]
    Io(#[cause] std::io::Error),
    /// Errors originating from calls to `nix::*` (`sysconf`, `writev`,
    /// signal registration).
    #[fail(display = "System Error - {}", _0)]
    System(#[cause] nix::Error),
    /// Backing-array allocation for a new ring, or the thread record itself,
    /// could not be obtained.
    #[fail(display = "Could not allocate ring or thread record")]
    AllocationFailed,
    /// The 32-bit thread-id counter wrapped back to zero.
    #[fail(display = "Ran out of thread ids")]
    ThreadIdsExhausted,
    /// `join` was called with a handle that the registry has no record of.
    #[fail(display = "Unknown thread handle")]
    UnknownThreadHandle,
    /// The serializer's `writev` wrote fewer bytes than the ring handed it;
    /// the trace file is now corrupt.
    #[fail(display = "Short write to trace file: wrote {} of {} bytes", wrote, expected)]
    ShortWrite {
        /// Bytes the ring asked the serializer to write.
        expected: usize,
        /// Bytes `writev` actually reported as written.
        wrote: usize,
    },
}

/// Result type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;
