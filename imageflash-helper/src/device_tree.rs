// SPDX-License-Identifier: GPL-3.0-only

//! Device registry queries: descendants of a disk and protected-root checks

use std::sync::Arc;

use imageflash_types::{DeviceId, DeviceNode};
use tracing::warn;

use crate::arbitration::DiskArbitration;

/// A registry entry below a disk that unmount and remount must visit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descendant<'a> {
    /// Whole-disk media: unmounted as a unit, children first
    WholeDisk {
        device: &'a DeviceId,
        node: &'a DeviceNode,
    },
    /// Partitions and container entries: only their children are visited
    PassThrough(&'a DeviceNode),
}

/// Direct children of `node`, storage media first, then everything else.
pub fn list_storage_descendants(node: &DeviceNode) -> Vec<Descendant<'_>> {
    let (media, others): (Vec<&DeviceNode>, Vec<&DeviceNode>) =
        node.children.iter().partition(|child| child.is_media());

    media
        .into_iter()
        .chain(others)
        .map(|child| match &child.device {
            Some(device) if child.whole_disk => Descendant::WholeDisk {
                device,
                node: child,
            },
            _ => Descendant::PassThrough(child),
        })
        .collect()
}

/// Whether a device with this lineage lives on `target`.
///
/// `lineage` is the device's own name followed by its media ancestors.
pub fn is_descendant_of<S: AsRef<str>>(lineage: &[S], target: &DeviceId) -> bool {
    lineage.iter().any(|name| target.contains(name.as_ref()))
}

/// Registry lookups that need the platform backend
#[derive(Clone)]
pub struct DeviceTreeWalker {
    backend: Arc<dyn DiskArbitration>,
}

impl DeviceTreeWalker {
    pub fn new(backend: Arc<dyn DiskArbitration>) -> Self {
        Self { backend }
    }

    /// Snapshot of the registry below `device`, `None` when it is gone.
    pub fn snapshot(&self, device: &DeviceId) -> Option<DeviceNode> {
        match self.backend.device_tree(device) {
            Ok(tree) => Some(tree),
            Err(e) => {
                warn!("Cannot read device tree of {device}: {e}");
                None
            }
        }
    }

    /// True when `device` hosts the running system's root volume.
    ///
    /// Lookup failures count as protected.
    pub fn is_protected_root(&self, device: &DeviceId) -> bool {
        let boot = match self.backend.boot_device() {
            Ok(boot) => boot,
            Err(e) => {
                warn!("Cannot determine boot device: {e}");
                return true;
            }
        };

        match self.backend.lineage(&boot) {
            Ok(lineage) => is_descendant_of(&lineage, device),
            Err(e) => {
                warn!("Cannot read lineage of boot device {boot}: {e}");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> DeviceId {
        DeviceId::parse(name).expect("valid id")
    }

    /// disk4 with a GPT scheme holding an EFI slice and an APFS container
    /// whose synthesized disk5 carries one volume.
    fn apfs_tree() -> DeviceNode {
        DeviceNode::media(
            id("disk4"),
            true,
            vec![DeviceNode::passthrough(vec![
                DeviceNode::media(id("disk4s1"), false, vec![]),
                DeviceNode::media(
                    id("disk4s2"),
                    false,
                    vec![DeviceNode::passthrough(vec![DeviceNode::media(
                        id("disk5"),
                        true,
                        vec![DeviceNode::media(id("disk5s1"), false, vec![])],
                    )])],
                ),
            ])],
        )
    }

    #[test]
    fn media_are_listed_before_other_entries() {
        let node = DeviceNode::media(
            id("disk2"),
            true,
            vec![
                DeviceNode::passthrough(vec![]),
                DeviceNode::media(id("disk3"), true, vec![]),
                DeviceNode::media(id("disk2s1"), false, vec![]),
            ],
        );

        let listed = list_storage_descendants(&node);
        assert_eq!(listed.len(), 3);
        assert!(matches!(
            listed[0],
            Descendant::WholeDisk { device, .. } if device.as_str() == "disk3"
        ));
        assert!(matches!(
            listed[1],
            Descendant::PassThrough(node) if node.device == Some(id("disk2s1"))
        ));
        assert!(matches!(listed[2], Descendant::PassThrough(node) if !node.is_media()));
    }

    #[test]
    fn nested_whole_disks_are_found_through_passthrough_entries() {
        let tree = apfs_tree();
        let [Descendant::PassThrough(scheme)] = list_storage_descendants(&tree)[..] else {
            panic!("expected the partition scheme");
        };
        let slices = list_storage_descendants(scheme);
        let Descendant::PassThrough(container_slice) = slices[1] else {
            panic!("expected the container slice");
        };
        let [Descendant::PassThrough(container)] = list_storage_descendants(container_slice)[..]
        else {
            panic!("expected the container");
        };
        assert!(matches!(
            list_storage_descendants(container)[..],
            [Descendant::WholeDisk { device, .. }] if device.as_str() == "disk5"
        ));
    }

    #[test]
    fn lineage_matches_target_and_its_slices_only() {
        let target = id("disk1");
        assert!(is_descendant_of(&["disk1s2"], &target));
        assert!(is_descendant_of(&["disk5s1", "disk5", "disk1s2", "disk1"], &target));
        assert!(!is_descendant_of(&["disk10s1", "disk10"], &target));
        assert!(!is_descendant_of::<&str>(&[], &target));
    }
}
