// SPDX-License-Identifier: GPL-3.0-only

//! Recording arbitration backend for tests

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use imageflash_types::{DeviceId, DeviceNode};

use super::{ArbitrationError, DiskArbitration, MountApproval, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Claim(String),
    Unclaim(String),
    Unmount(String),
    Mount(String),
    Eject(String),
    RegisterVeto,
    UnregisterVeto,
}

#[derive(Default)]
pub struct FakeArbitration {
    calls: Mutex<Vec<Call>>,
    trees: Mutex<HashMap<String, DeviceNode>>,
    lineages: Mutex<HashMap<String, Vec<String>>>,
    boot: Mutex<Option<String>>,
    volumes: Mutex<HashMap<String, PathBuf>>,
    sizes: Mutex<HashMap<String, u64>>,
    failing: Mutex<HashSet<(&'static str, String)>>,
    hanging: Mutex<HashSet<(&'static str, String)>>,
    policy: Mutex<Option<Arc<dyn MountApproval>>>,
}

impl FakeArbitration {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.set_boot("disk0s1");
        Arc::new(fake)
    }

    pub fn set_tree(&self, tree: DeviceNode) {
        if let Some(device) = &tree.device {
            self.trees
                .lock()
                .unwrap()
                .insert(device.to_string(), tree.clone());
        }
    }

    pub fn set_lineage(&self, device: &str, lineage: &[&str]) {
        self.lineages.lock().unwrap().insert(
            device.to_string(),
            lineage.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn set_boot(&self, device: &str) {
        *self.boot.lock().unwrap() = Some(device.to_string());
    }

    pub fn clear_boot(&self) {
        *self.boot.lock().unwrap() = None;
    }

    pub fn set_volume(&self, device: &str, path: &Path) {
        self.volumes
            .lock()
            .unwrap()
            .insert(device.to_string(), path.to_path_buf());
    }

    pub fn set_media_size(&self, device: &str, size: u64) {
        self.sizes.lock().unwrap().insert(device.to_string(), size);
    }

    /// Make `operation` ("claim", "unmount", "mount", "eject") fail for `device`.
    pub fn fail(&self, operation: &'static str, device: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((operation, device.to_string()));
    }

    /// Make `operation` never complete for `device`.
    pub fn hang(&self, operation: &'static str, device: &str) {
        self.hanging
            .lock()
            .unwrap()
            .insert((operation, device.to_string()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn veto_registered(&self) -> bool {
        self.policy.lock().unwrap().is_some()
    }

    /// Ask the registered mount policy about a mount of `device`.
    pub fn review_mount(&self, device: &str) -> Option<String> {
        let lineage = self.lineage_of(device);
        let policy = self.policy.lock().unwrap().clone();
        policy.and_then(|policy| policy.review(&lineage))
    }

    fn lineage_of(&self, device: &str) -> Vec<String> {
        self.lineages
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .unwrap_or_else(|| vec![device.to_string()])
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn complete(&self, operation: &'static str, device: &DeviceId) -> Result<()> {
        let key = (operation, device.to_string());
        let hangs = self.hanging.lock().unwrap().contains(&key);
        if hangs {
            std::future::pending::<()>().await;
        }
        let fails = self.failing.lock().unwrap().contains(&key);
        if fails {
            return Err(ArbitrationError::Dissented {
                operation,
                device: device.to_string(),
                reason: "Resource busy".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DiskArbitration for FakeArbitration {
    async fn claim(&self, device: &DeviceId) -> Result<()> {
        self.record(Call::Claim(device.to_string()));
        self.complete("claim", device).await
    }

    fn unclaim(&self, device: &DeviceId) {
        self.record(Call::Unclaim(device.to_string()));
    }

    async fn unmount(&self, device: &DeviceId) -> Result<()> {
        self.record(Call::Unmount(device.to_string()));
        self.complete("unmount", device).await
    }

    async fn mount(&self, device: &DeviceId) -> Result<()> {
        self.record(Call::Mount(device.to_string()));
        if let Some(reason) = self.review_mount(device.as_str()) {
            return Err(ArbitrationError::Dissented {
                operation: "mount",
                device: device.to_string(),
                reason,
            });
        }
        self.complete("mount", device).await
    }

    async fn eject(&self, device: &DeviceId) -> Result<()> {
        self.record(Call::Eject(device.to_string()));
        self.complete("eject", device).await
    }

    fn device_tree(&self, device: &DeviceId) -> Result<DeviceNode> {
        Ok(self
            .trees
            .lock()
            .unwrap()
            .get(device.as_str())
            .cloned()
            .unwrap_or_else(|| DeviceNode::media(device.clone(), device.is_whole_disk(), vec![])))
    }

    fn lineage(&self, device: &DeviceId) -> Result<Vec<String>> {
        Ok(self.lineage_of(device.as_str()))
    }

    fn boot_device(&self) -> Result<DeviceId> {
        let boot = self.boot.lock().unwrap().clone();
        boot.and_then(|name| DeviceId::parse(&name).ok())
            .ok_or_else(|| ArbitrationError::Session("statfs failed".to_string()))
    }

    fn volume_path(&self, device: &DeviceId) -> Result<Option<PathBuf>> {
        Ok(self.volumes.lock().unwrap().get(device.as_str()).cloned())
    }

    fn media_size(&self, device: &DeviceId) -> Result<Option<u64>> {
        Ok(self.sizes.lock().unwrap().get(device.as_str()).copied())
    }

    fn register_mount_approval(&self, policy: Arc<dyn MountApproval>) -> Result<()> {
        self.record(Call::RegisterVeto);
        *self.policy.lock().unwrap() = Some(policy);
        Ok(())
    }

    fn unregister_mount_approval(&self) {
        self.record(Call::UnregisterVeto);
        *self.policy.lock().unwrap() = None;
    }
}
