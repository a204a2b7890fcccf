// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the kernel publishes device nodes
pub const DEVICE_DIR: &str = "/dev";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device identifier '{0}'")]
pub struct InvalidDeviceId(pub String);

/// BSD name of a disk or one of its slices (`disk2`, `disk2s1`, `disk3s1s1`)
///
/// This is the handle every arbitration and device-tree operation takes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Accept any disk or slice identifier.
    pub fn parse(name: &str) -> Result<Self, InvalidDeviceId> {
        let rest = name
            .strip_prefix("disk")
            .ok_or_else(|| InvalidDeviceId(name.to_string()))?;

        let mut segments = rest.split('s');
        let valid = segments.all(|segment| {
            !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
        });

        if !valid {
            return Err(InvalidDeviceId(name.to_string()));
        }

        Ok(Self(name.to_string()))
    }

    /// Accept only whole-disk identifiers (`disk<N>`), the only valid write targets.
    pub fn whole_disk(name: &str) -> Result<Self, InvalidDeviceId> {
        let id = Self::parse(name)?;
        if !id.is_whole_disk() {
            return Err(InvalidDeviceId(name.to_string()));
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_whole_disk(&self) -> bool {
        !self.0["disk".len()..].contains('s')
    }

    /// Identifier of slice `index` of this device.
    pub fn slice(&self, index: u32) -> DeviceId {
        DeviceId(format!("{}s{}", self.0, index))
    }

    /// Unbuffered character node below `device_dir`, e.g. `/dev/rdisk2`.
    pub fn raw_node_in(&self, device_dir: &Path) -> PathBuf {
        device_dir.join(format!("r{}", self.0))
    }

    /// True when `name` is this device or one of its slices.
    pub fn contains(&self, name: &str) -> bool {
        name == self.0
            || name
                .strip_prefix(self.0.as_str())
                .is_some_and(|rest| rest.starts_with('s'))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

/// One entry of the device registry below a disk.
///
/// Storage media carry a `device` id; other registry entries (partition
/// schemes, container drivers) have none and only pass their children through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub device: Option<DeviceId>,
    pub whole_disk: bool,
    pub children: Vec<DeviceNode>,
}

impl DeviceNode {
    pub fn media(device: DeviceId, whole_disk: bool, children: Vec<DeviceNode>) -> Self {
        Self {
            device: Some(device),
            whole_disk,
            children,
        }
    }

    pub fn passthrough(children: Vec<DeviceNode>) -> Self {
        Self {
            device: None,
            whole_disk: false,
            children,
        }
    }

    pub fn is_media(&self) -> bool {
        self.device.is_some()
    }
}
