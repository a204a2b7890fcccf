// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use imageflash_types::{DeviceId, DeviceNode};

use super::{ArbitrationError, DiskArbitration, MountApproval, Result};

/// Backend for platforms without a disk arbitration service; every call fails.
pub struct UnsupportedArbitration;

#[async_trait]
impl DiskArbitration for UnsupportedArbitration {
    async fn claim(&self, _device: &DeviceId) -> Result<()> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn unclaim(&self, _device: &DeviceId) {}

    async fn unmount(&self, _device: &DeviceId) -> Result<()> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    async fn mount(&self, _device: &DeviceId) -> Result<()> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    async fn eject(&self, _device: &DeviceId) -> Result<()> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn device_tree(&self, _device: &DeviceId) -> Result<DeviceNode> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn lineage(&self, _device: &DeviceId) -> Result<Vec<String>> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn boot_device(&self) -> Result<DeviceId> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn volume_path(&self, _device: &DeviceId) -> Result<Option<PathBuf>> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn media_size(&self, _device: &DeviceId) -> Result<Option<u64>> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn register_mount_approval(&self, _policy: Arc<dyn MountApproval>) -> Result<()> {
        Err(ArbitrationError::PlatformNotSupported)
    }

    fn unregister_mount_approval(&self) {}
}
