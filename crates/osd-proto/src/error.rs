/// Object storage error types.
///
/// Every failure the storage engine can report is one variant of a single
/// fieldless enum, so errors are cheap to copy across task boundaries and
/// can be encoded as a numeric code by whatever request layer sits on top.

use serde::{Deserialize, Serialize};

/// Unified error type for all object storage operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum OsdError {
    #[error("object, version or file not found")]
    NotFound,
    #[error("request carries a stale truncate epoch")]
    StaleEpoch,
    #[error("stored checksum does not match object content")]
    ChecksumMismatch,
    #[error("I/O error")]
    Eio,
    #[error("conflicting advisory lock held by another client")]
    LockConflict,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("storage layout not initialized")]
    NoStore,
    #[error("system error")]
    SystemError,
    #[error("file is not open")]
    NotOpen,
    #[error("on-disk layout does not match the configured layout")]
    LayoutMismatch,
}

impl OsdError {
    /// Convert from a raw error code to OsdError.
    ///
    /// Code 0 is success and yields `None`; unknown codes collapse to
    /// `SystemError`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None,
            0x01 => Some(Self::NotFound),
            0x02 => Some(Self::StaleEpoch),
            0x03 => Some(Self::ChecksumMismatch),
            0x04 => Some(Self::Eio),
            0x05 => Some(Self::LockConflict),
            0x06 => Some(Self::InvalidParms),
            0x07 => Some(Self::NoStore),
            0x08 => Some(Self::SystemError),
            0x09 => Some(Self::NotOpen),
            0x0A => Some(Self::LayoutMismatch),
            _ => Some(Self::SystemError),
        }
    }

    /// Convert to raw error code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::NotFound => 0x01,
            Self::StaleEpoch => 0x02,
            Self::ChecksumMismatch => 0x03,
            Self::Eio => 0x04,
            Self::LockConflict => 0x05,
            Self::InvalidParms => 0x06,
            Self::NoStore => 0x07,
            Self::SystemError => 0x08,
            Self::NotOpen => 0x09,
            Self::LayoutMismatch => 0x0A,
        }
    }

    /// POSIX errno equivalent, for request layers that speak errno.
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => 2,          // ENOENT
            Self::StaleEpoch => 116,      // ESTALE
            Self::ChecksumMismatch => 74, // EBADMSG
            Self::Eio => 5,               // EIO
            Self::LockConflict => 11,     // EAGAIN
            Self::InvalidParms => 22,     // EINVAL
            Self::NoStore => 19,          // ENODEV
            Self::SystemError => 5,
            Self::NotOpen => 9,           // EBADF
            Self::LayoutMismatch => 22,
        }
    }
}

/// Result type alias for object storage operations.
pub type OsdResult<T> = Result<T, OsdError>;

impl From<std::io::Error> for OsdError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            OsdError::NotFound
        } else {
            OsdError::Eio
        }
    }
}
