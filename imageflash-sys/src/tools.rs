// SPDX-License-Identifier: GPL-3.0-only

//! Wrappers around the partitioning and image-mounting tools

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use imageflash_types::{DeviceId, volume_label};
use tracing::{debug, info, warn};
use which::which;

use crate::error::{Result, SysError};

/// Locations of the external tools the helper shells out to
#[derive(Debug, Clone)]
pub struct Tools {
    diskutil: PathBuf,
    hdiutil: PathBuf,
}

impl Tools {
    /// Resolve tool locations; bare names are looked up on `PATH`.
    pub fn resolve(diskutil: &Path, hdiutil: &Path) -> Result<Self> {
        Ok(Self {
            diskutil: resolve_tool(diskutil)?,
            hdiutil: resolve_tool(hdiutil)?,
        })
    }

    /// Repartition `device` as GPT with one ExFAT data partition filling the disk
    ///
    /// The partitioner adds the EFI system partition as slice 1 on its own,
    /// so the data partition ends up as slice 2.
    pub fn partition_device(&self, device: &DeviceId, label: &str) -> Result<()> {
        let label = volume_label(label);
        info!("Partitioning {device} with label {label:?}");

        let output = run(
            &self.diskutil,
            &[
                "partitionDisk",
                device.as_str(),
                "1",
                "GPT",
                "ExFAT",
                label.as_str(),
                "0",
            ],
        )
        .map_err(|e| SysError::PartitionFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Partitioning {device} failed: {stderr}");
            return Err(SysError::PartitionFailed(format!(
                "{} exited with {}: {}",
                self.diskutil.display(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }

    /// Attach a disk image and return where its volume got mounted
    pub fn attach_image(&self, image: &Path) -> Result<PathBuf> {
        info!("Mounting image {}", image.display());
        let image_arg = image.to_string_lossy();

        let output = run(&self.hdiutil, &["attach", "-plist", image_arg.as_ref()])
            .map_err(|e| SysError::AttachFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(SysError::AttachFailed(format!(
                "{} exited with {}: {}",
                self.hdiutil.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mount_point = parse_attach_output(&output.stdout)?;
        info!("Image mounted at {}", mount_point.display());
        Ok(mount_point)
    }

    /// Detach an image previously attached with [`Tools::attach_image`]
    pub fn detach_image(&self, mount_point: &Path) -> Result<()> {
        let mount_arg = mount_point.to_string_lossy();
        let output = run(&self.hdiutil, &["detach", mount_arg.as_ref()])
            .map_err(|e| SysError::DetachFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(SysError::DetachFailed(format!(
                "{} exited with {}",
                self.hdiutil.display(),
                output.status
            )));
        }

        Ok(())
    }
}

fn resolve_tool(tool: &Path) -> Result<PathBuf> {
    if tool.is_absolute() {
        return Ok(tool.to_path_buf());
    }
    which(tool).map_err(|_| SysError::ToolNotFound(tool.display().to_string()))
}

fn run(program: &Path, args: &[&str]) -> std::io::Result<Output> {
    debug!("Running {} {:?}", program.display(), args);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;

    debug!(
        "{} finished with {}\nstdout: {}\nstderr: {}",
        program.display(),
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(output)
}

/// Extract the mount point from `hdiutil attach -plist` output
///
/// The first system entity carrying a `mount-point` wins; hybrid images list
/// their partition map entities before the mounted volume.
pub fn parse_attach_output(output: &[u8]) -> Result<PathBuf> {
    let plist: plist::Value = plist::from_bytes(output)
        .map_err(|e| SysError::AttachFailed(format!("Malformed attach output: {e}")))?;

    let entities = plist
        .as_dictionary()
        .and_then(|d| d.get("system-entities"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| SysError::AttachFailed("Missing system-entities".to_string()))?;

    entities
        .iter()
        .filter_map(|entity| entity.as_dictionary())
        .find_map(|entity| entity.get("mount-point").and_then(|v| v.as_string()))
        .map(PathBuf::from)
        .ok_or_else(|| SysError::AttachFailed("No mount point in attach output".to_string()))
}
