//! Kernel status codes.
//!
//! Every fallible kernel interface returns an [`OsStatus`] through
//! [`OsResult`]. The numeric values are part of the system call ABI and
//! must not be reordered; userspace sees them verbatim in
//! `OsCallResult::status`.

use core::fmt;

/// Status code for every kernel operation.
///
/// `Success` is never carried inside an `Err`; it exists so the full wire
/// encoding round-trips through [`OsStatus::from_code`].
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "status codes must be handled, not silently discarded"]
pub enum OsStatus {
    /// The operation was successful.
    Success = 0x0,
    /// The operation could not be completed due to a lack of memory.
    OutOfMemory = 0x1,
    /// The requested resource could not be found.
    NotFound = 0x2,
    /// The input to the operation was invalid.
    InvalidInput = 0x3,
    /// The resource does not support the operation.
    NotSupported = 0x4,
    /// The resource already exists.
    AlreadyExists = 0x5,
    /// While walking a path a non-folder node was encountered mid-path.
    TraverseNonFolder = 0x6,
    /// The node is not of the type the operation expects.
    InvalidType = 0x7,
    /// The node has outstanding exclusive holders and cannot be removed.
    HandleLocked = 0x8,
    /// The path is malformed: invalid characters, empty segments, or
    /// leading/trailing separators.
    InvalidPath = 0x9,
    /// An unknown system call function id was invoked.
    InvalidFunction = 0xa,
    /// The end of the file was reached.
    EndOfFile = 0xb,
    /// A resource is in an invalid state, distinct from `InvalidInput`.
    InvalidData = 0xc,
    /// The version field of a structure was not recognised.
    InvalidVersion = 0xd,
    /// The operation timed out.
    Timeout = 0xe,
    /// An index or offset was outside the valid range.
    OutOfBounds = 0xf,
    /// Enumeration was truncated; retry with a larger buffer.
    MoreData = 0x10,
    /// A stored checksum did not match the computed one.
    ChecksumError = 0x11,
    /// The handle does not name a live entry in the handle table.
    InvalidHandle = 0x12,
    /// A pointer referenced unmapped memory or memory without the
    /// required access rights.
    InvalidAddress = 0x13,
    /// A [front, back) span overflowed or was reversed.
    InvalidSpan = 0x14,
    /// The device reported a hard failure.
    DeviceFault = 0x15,
    /// The device is busy servicing another request.
    DeviceBusy = 0x16,
    /// The device is not ready to service requests.
    DeviceNotReady = 0x17,
    /// The node does not implement the requested interface.
    InterfaceNotSupported = 0x18,
    /// The interface does not implement the requested function.
    FunctionNotSupported = 0x19,
    /// The object has already run to completion.
    Completed = 0x1a,
    /// The handle lacks the rights required for the operation.
    AccessDenied = 0x1b,
    /// The owning process exited while the operation was in flight.
    ProcessOrphaned = 0x1c,
    /// The resource exists but is not currently available.
    NotAvailable = 0x1d,
}

/// Result type alias for kernel operations.
pub type OsResult<T = ()> = Result<T, OsStatus>;

impl OsStatus {
    /// The wire encoding of this status.
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Decode a wire status. Unknown codes collapse to `InvalidData`.
    pub fn from_code(code: u64) -> OsStatus {
        match code {
            0x0 => Self::Success,
            0x1 => Self::OutOfMemory,
            0x2 => Self::NotFound,
            0x3 => Self::InvalidInput,
            0x4 => Self::NotSupported,
            0x5 => Self::AlreadyExists,
            0x6 => Self::TraverseNonFolder,
            0x7 => Self::InvalidType,
            0x8 => Self::HandleLocked,
            0x9 => Self::InvalidPath,
            0xa => Self::InvalidFunction,
            0xb => Self::EndOfFile,
            0xc => Self::InvalidData,
            0xd => Self::InvalidVersion,
            0xe => Self::Timeout,
            0xf => Self::OutOfBounds,
            0x10 => Self::MoreData,
            0x11 => Self::ChecksumError,
            0x12 => Self::InvalidHandle,
            0x13 => Self::InvalidAddress,
            0x14 => Self::InvalidSpan,
            0x15 => Self::DeviceFault,
            0x16 => Self::DeviceBusy,
            0x17 => Self::DeviceNotReady,
            0x18 => Self::InterfaceNotSupported,
            0x19 => Self::FunctionNotSupported,
            0x1a => Self::Completed,
            0x1b => Self::AccessDenied,
            0x1c => Self::ProcessOrphaned,
            0x1d => Self::NotAvailable,
            _ => Self::InvalidData,
        }
    }

    /// Encode a result as a wire status: `Ok` becomes zero.
    pub fn encode<T>(result: &OsResult<T>) -> u64 {
        match result {
            Ok(_) => 0,
            Err(status) => status.code(),
        }
    }
}

impl fmt::Display for OsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::OutOfMemory => "out of memory",
            Self::NotFound => "not found",
            Self::InvalidInput => "invalid input",
            Self::NotSupported => "not supported",
            Self::AlreadyExists => "already exists",
            Self::TraverseNonFolder => "traverse over non-folder",
            Self::InvalidType => "invalid node type",
            Self::HandleLocked => "handle locked",
            Self::InvalidPath => "invalid path",
            Self::InvalidFunction => "invalid function",
            Self::EndOfFile => "end of file",
            Self::InvalidData => "invalid data",
            Self::InvalidVersion => "invalid version",
            Self::Timeout => "timeout",
            Self::OutOfBounds => "out of bounds",
            Self::MoreData => "more data available",
            Self::ChecksumError => "checksum mismatch",
            Self::InvalidHandle => "invalid handle",
            Self::InvalidAddress => "invalid address",
            Self::InvalidSpan => "invalid span",
            Self::DeviceFault => "device fault",
            Self::DeviceBusy => "device busy",
            Self::DeviceNotReady => "device not ready",
            Self::InterfaceNotSupported => "interface not supported",
            Self::FunctionNotSupported => "function not supported",
            Self::Completed => "already completed",
            Self::AccessDenied => "access denied",
            Self::ProcessOrphaned => "process orphaned",
            Self::NotAvailable => "not available",
        };
        f.write_str(text)
    }
}
