use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    #[error("snapshot marker mismatch (expected {expected:?}, found {found:?})")]
    MarkerMismatch { expected: &'static str, found: String },

    /// The saved state was produced by a different device implementation.
    #[error("device state mismatch (expected {expected}, found {found})")]
    DeviceMismatch { expected: String, found: String },

    /// A descriptor references a static device that the current registry does not have.
    #[error("snapshot references unknown device {0:?}")]
    UnknownDevice(String),

    #[error("unknown device kind {0}")]
    UnknownDeviceKind(u8),

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
