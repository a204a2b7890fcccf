// SPDX-License-Identifier: GPL-3.0-only

//! Platform disk arbitration
//!
//! The helper never touches the platform's arbitration service directly;
//! claim, unmount and mount-approval logic goes through [`DiskArbitration`]
//! so it can run against a recording backend in tests.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use imageflash_types::{DeviceId, DeviceNode};
use thiserror::Error;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(not(target_os = "macos"))]
mod unsupported;

#[cfg(test)]
pub mod fake;

#[derive(Debug, Clone, Error)]
pub enum ArbitrationError {
    #[error("{operation} of {device} was refused: {reason}")]
    Dissented {
        operation: &'static str,
        device: String,
        reason: String,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Arbitration session unavailable: {0}")]
    Session(String),

    #[error("Disk arbitration is not available on this platform")]
    PlatformNotSupported,
}

pub type Result<T> = std::result::Result<T, ArbitrationError>;

/// Decides whether a mount request may proceed.
pub trait MountApproval: Send + Sync {
    /// `lineage` is the mounting device's name followed by its media
    /// ancestors. Returns the dissent reason to veto the mount.
    fn review(&self, lineage: &[String]) -> Option<String>;
}

/// Operations the helper needs from the platform's disk arbitration service
///
/// Asynchronous operations complete when the platform reports completion;
/// callers bound them with their own timeout.
#[async_trait]
pub trait DiskArbitration: Send + Sync {
    /// Take exclusive ownership of a disk.
    async fn claim(&self, device: &DeviceId) -> Result<()>;

    fn unclaim(&self, device: &DeviceId);

    /// Force-unmount every volume of `device`.
    async fn unmount(&self, device: &DeviceId) -> Result<()>;

    /// Mount every volume of `device`.
    async fn mount(&self, device: &DeviceId) -> Result<()>;

    async fn eject(&self, device: &DeviceId) -> Result<()>;

    /// Registry entries below `device`.
    fn device_tree(&self, device: &DeviceId) -> Result<DeviceNode>;

    /// `device` followed by the media it sits on, nearest first.
    fn lineage(&self, device: &DeviceId) -> Result<Vec<String>>;

    /// Device backing the root filesystem.
    fn boot_device(&self) -> Result<DeviceId>;

    /// Mount point of a volume, `None` while unmounted.
    fn volume_path(&self, device: &DeviceId) -> Result<Option<PathBuf>>;

    fn media_size(&self, device: &DeviceId) -> Result<Option<u64>>;

    /// Route every mount request through `policy` until unregistered.
    fn register_mount_approval(&self, policy: Arc<dyn MountApproval>) -> Result<()>;

    fn unregister_mount_approval(&self);
}

/// Arbitration backend for the platform the helper was built for.
pub fn platform_backend() -> Result<Arc<dyn DiskArbitration>> {
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(macos::MacDiskArbitration::start()?))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Ok(Arc::new(unsupported::UnsupportedArbitration))
    }
}
