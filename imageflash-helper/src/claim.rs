// SPDX-License-Identifier: GPL-3.0-only

//! Exclusive access to a target disk
//!
//! The methods here block the calling thread until the platform answers or
//! the arbitration timeout elapses, so they are meant for job workers and
//! blocking tasks, never for async code on the runtime's worker threads.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use imageflash_types::{DeviceId, DeviceNode};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::arbitration::{self, DiskArbitration, MountApproval};
use crate::device_tree::{Descendant, DeviceTreeWalker, is_descendant_of, list_storage_descendants};

/// Dissent reason shown for vetoed mounts.
pub const VETO_REASON: &str = "Writing image";

/// Refuses mounts of the target disk and anything on it
struct MountVeto {
    target: DeviceId,
}

impl MountApproval for MountVeto {
    fn review(&self, lineage: &[String]) -> Option<String> {
        if is_descendant_of(lineage, &self.target) {
            debug!("Vetoing mount of {:?} while writing {}", lineage.first(), self.target);
            Some(VETO_REASON.to_string())
        } else {
            None
        }
    }
}

pub struct ClaimCoordinator {
    backend: Arc<dyn DiskArbitration>,
    walker: DeviceTreeWalker,
    runtime: Handle,
    timeout: Duration,
}

impl ClaimCoordinator {
    pub fn new(backend: Arc<dyn DiskArbitration>, runtime: Handle, timeout: Duration) -> Self {
        Self {
            walker: DeviceTreeWalker::new(backend.clone()),
            backend,
            runtime,
            timeout,
        }
    }

    pub fn walker(&self) -> &DeviceTreeWalker {
        &self.walker
    }

    /// Run one arbitration request to completion; timeouts count as failure.
    fn wait<F>(&self, operation: &str, device: &DeviceId, request: F) -> bool
    where
        F: Future<Output = arbitration::Result<()>>,
    {
        match self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, request).await })
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Failed to {operation} {device}: {e}");
                false
            }
            Err(_) => {
                warn!(
                    "Timed out after {:?} waiting to {operation} {device}",
                    self.timeout
                );
                false
            }
        }
    }

    /// Take exclusive ownership of `device`.
    pub fn claim(self: &Arc<Self>, device: &DeviceId) -> Option<DeviceClaim> {
        info!("Claiming {device}");
        if !self.wait("claim", device, self.backend.claim(device)) {
            // A claim that completes after the timeout must not linger.
            self.backend.unclaim(device);
            return None;
        }

        Some(DeviceClaim {
            coordinator: Arc::clone(self),
            device: device.clone(),
            veto_armed: false,
            released: false,
        })
    }

    /// Unmount every volume on `device`, nested whole disks first.
    ///
    /// Returns false if anything stayed mounted; siblings of a failed entry
    /// are still attempted.
    pub fn unmount(&self, device: &DeviceId) -> bool {
        let Some(tree) = self.walker.snapshot(device) else {
            return false;
        };
        self.unmount_media(device, &tree)
    }

    fn unmount_media(&self, device: &DeviceId, node: &DeviceNode) -> bool {
        info!("Unmounting {device}");
        if !self.unmount_children(node) {
            warn!("Not unmounting {device}: a nested disk stayed mounted");
            return false;
        }
        self.wait("unmount", device, self.backend.unmount(device))
    }

    fn unmount_children(&self, node: &DeviceNode) -> bool {
        let mut all_unmounted = true;
        for descendant in list_storage_descendants(node) {
            let unmounted = match descendant {
                Descendant::WholeDisk { device, node } => self.unmount_media(device, node),
                Descendant::PassThrough(node) => self.unmount_children(node),
            };
            all_unmounted &= unmounted;
        }
        all_unmounted
    }

    /// Mount `device` and nested whole disks again; failures are only logged.
    pub fn remount(&self, device: &DeviceId) {
        info!("Remounting {device}");
        self.wait("mount", device, self.backend.mount(device));
        if let Some(tree) = self.walker.snapshot(device) {
            self.remount_children(&tree);
        }
    }

    fn remount_children(&self, node: &DeviceNode) {
        for descendant in list_storage_descendants(node) {
            match descendant {
                Descendant::WholeDisk { device, node } => {
                    self.wait("mount", device, self.backend.mount(device));
                    self.remount_children(node);
                }
                Descendant::PassThrough(node) => self.remount_children(node),
            }
        }
    }

    /// Unmount and eject `device`.
    pub fn eject(&self, device: &DeviceId) -> bool {
        if !self.unmount(device) {
            return false;
        }
        info!("Ejecting {device}");
        self.wait("eject", device, self.backend.eject(device))
    }

    /// Veto every mount on `device` until [`ClaimCoordinator::allow_mount`].
    pub fn prevent_mount(&self, device: &DeviceId) -> bool {
        let veto = Arc::new(MountVeto {
            target: device.clone(),
        });
        match self.backend.register_mount_approval(veto) {
            Ok(()) => {
                debug!("Mounts on {device} are vetoed");
                true
            }
            Err(e) => {
                warn!("Cannot veto mounts on {device}: {e}");
                false
            }
        }
    }

    pub fn allow_mount(&self) {
        self.backend.unregister_mount_approval();
    }

    pub fn volume_path(&self, device: &DeviceId) -> Option<PathBuf> {
        self.backend.volume_path(device).unwrap_or_else(|e| {
            warn!("Cannot read volume path of {device}: {e}");
            None
        })
    }

    pub fn media_size(&self, device: &DeviceId) -> Option<u64> {
        self.backend.media_size(device).unwrap_or_else(|e| {
            debug!("Cannot read media size of {device}: {e}");
            None
        })
    }
}

/// Exclusive ownership of a disk, released exactly once
///
/// Dropping the claim lifts any mount veto and unclaims the disk.
pub struct DeviceClaim {
    coordinator: Arc<ClaimCoordinator>,
    device: DeviceId,
    veto_armed: bool,
    released: bool,
}

impl DeviceClaim {
    pub fn prevent_mount(&mut self) -> bool {
        if !self.veto_armed {
            self.veto_armed = self.coordinator.prevent_mount(&self.device);
        }
        self.veto_armed
    }

    pub fn allow_mount(&mut self) {
        if self.veto_armed {
            self.coordinator.allow_mount();
            self.veto_armed = false;
        }
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.allow_mount();
        self.coordinator.backend.unclaim(&self.device);
        self.released = true;
        info!("Released {}", self.device);
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.release_once();
    }
}
