// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::DeviceId;

/// Longest volume label an ExFAT data partition accepts
pub const EXFAT_LABEL_MAX: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source '{0}' is not a local file path")]
pub struct InvalidSource(pub String);

/// Identifier of one accepted flashing job, used to correlate logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FlashMode {
    /// Byte-for-byte copy of the image onto the raw disk
    Direct,
    /// Partition the disk, copy the ISO contents and inject the UEFI bootloader
    WindowsInstaller { label: String },
}

/// A validated request to flash one image onto one disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRequest {
    pub source: PathBuf,
    pub target: DeviceId,
    pub mode: FlashMode,
}

impl FlashRequest {
    pub fn direct(source: impl Into<PathBuf>, target: DeviceId) -> Self {
        Self {
            source: source.into(),
            target,
            mode: FlashMode::Direct,
        }
    }

    /// The label is truncated to what the data partition's filesystem accepts.
    pub fn windows(source: impl Into<PathBuf>, target: DeviceId, label: &str) -> Self {
        Self {
            source: source.into(),
            target,
            mode: FlashMode::WindowsInstaller {
                label: volume_label(label),
            },
        }
    }
}

/// Accept an absolute path or a `file://` URL naming a local file.
pub fn parse_source(source: &str) -> Result<PathBuf, InvalidSource> {
    let invalid = || InvalidSource(source.to_string());

    let path = if source.contains("://") {
        let url = Url::parse(source).map_err(|_| invalid())?;
        if url.scheme() != "file" {
            return Err(invalid());
        }
        url.to_file_path().map_err(|_| invalid())?
    } else {
        PathBuf::from(source)
    };

    let text = path.to_string_lossy();
    if text.is_empty() || text.contains('\0') || !path.is_absolute() || text == "/" {
        return Err(invalid());
    }

    Ok(path)
}

pub fn volume_label(label: &str) -> String {
    label.chars().take(EXFAT_LABEL_MAX).collect()
}
