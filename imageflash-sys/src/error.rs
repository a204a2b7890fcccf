// SPDX-License-Identifier: GPL-3.0-only

use imageflash_types::HelperErrorKind;
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Read failed: {0}")]
    Read(std::io::Error),

    #[error("Write failed: {0}")]
    Write(std::io::Error),

    #[error("Target accepted only part of a chunk after {written} bytes")]
    OutOfSpace { written: u64 },

    #[error("Partitioning failed: {0}")]
    PartitionFailed(String),

    #[error("Image could not be attached: {0}")]
    AttachFailed(String),

    #[error("Image could not be detached: {0}")]
    DetachFailed(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Boot image unavailable: {0}")]
    BootImage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SysError {
    /// Failure kind reported to the subscriber
    pub fn kind(&self) -> HelperErrorKind {
        match self {
            Self::Cancelled => HelperErrorKind::Cancelled,
            Self::Read(_) | Self::AttachFailed(_) | Self::DetachFailed(_) => {
                HelperErrorKind::ReadError
            }
            Self::Write(_) | Self::PartitionFailed(_) => HelperErrorKind::WriteError,
            Self::OutOfSpace { .. } => HelperErrorKind::OutOfSpace,
            Self::ToolNotFound(_) | Self::BootImage(_) | Self::Io(_) => HelperErrorKind::Unknown,
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
