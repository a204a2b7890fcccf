// SPDX-License-Identifier: GPL-3.0-only

//! Image file inspection

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, SysError};

/// Offset of the publisher field in the ISO 9660 primary volume descriptor
const PUBLISHER_OFFSET: u64 = 0x813E;
const WINDOWS_PUBLISHER: &[u8] = b"MICROSOFT CORPORATION";

/// Size of a regular file, `None` for devices and unreadable paths
pub fn source_size(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    metadata.is_file().then(|| metadata.len())
}

/// Whether the image looks like Windows installation media
///
/// Only used as a UI hint: the publisher field of the primary volume
/// descriptor is compared against Microsoft's.
pub fn detect_windows_image(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(SysError::Read)?;
    file.seek(SeekFrom::Start(PUBLISHER_OFFSET))
        .map_err(SysError::Read)?;

    let mut publisher = [0u8; WINDOWS_PUBLISHER.len()];
    match file.read_exact(&mut publisher) {
        Ok(()) => Ok(publisher == WINDOWS_PUBLISHER),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(SysError::Read(e)),
    }
}

/// Load the UEFI bootloader payload written to installer media
pub fn load_boot_image(path: &Path) -> Result<Vec<u8>> {
    let payload = std::fs::read(path)
        .map_err(|e| SysError::BootImage(format!("{}: {e}", path.display())))?;
    if payload.is_empty() {
        return Err(SysError::BootImage(format!("{} is empty", path.display())));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image_with_publisher(publisher: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp image");
        let mut data = vec![0u8; 0x9000];
        let start = PUBLISHER_OFFSET as usize;
        data[start..start + publisher.len()].copy_from_slice(publisher);
        file.write_all(&data).expect("write image");
        file
    }

    #[test]
    fn detects_microsoft_publisher() {
        let image = image_with_publisher(b"MICROSOFT CORPORATION");
        assert!(detect_windows_image(image.path()).expect("readable"));
    }

    #[test]
    fn other_publishers_are_not_windows() {
        let image = image_with_publisher(b"CANONICAL LTD");
        assert!(!detect_windows_image(image.path()).expect("readable"));
    }

    #[test]
    fn short_files_are_not_windows() {
        let mut file = tempfile::NamedTempFile::new().expect("temp image");
        file.write_all(&[0u8; 512]).expect("write image");
        assert!(!detect_windows_image(file.path()).expect("readable"));
    }

    #[test]
    fn directories_have_no_source_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(source_size(dir.path()), None);

        let file = dir.path().join("a.img");
        std::fs::write(&file, [1u8; 10]).expect("write");
        assert_eq!(source_size(&file), Some(10));
    }

    #[test]
    fn missing_or_empty_boot_image_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("uefi-ntfs.img");
        assert!(matches!(load_boot_image(&path), Err(SysError::BootImage(_))));

        std::fs::write(&path, b"").expect("write empty");
        assert!(matches!(load_boot_image(&path), Err(SysError::BootImage(_))));

        std::fs::write(&path, [0xEBu8, 0x3C, 0x90]).expect("write payload");
        assert_eq!(load_boot_image(&path).expect("payload"), vec![0xEB, 0x3C, 0x90]);
    }
}
