// SPDX-License-Identifier: GPL-3.0-only

//! Chunked byte copies onto disks and files
//!
//! Every copy polls its cancellation token before each chunk, so a cancelled
//! job stops after at most one chunk of I/O.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use imageflash_types::bytes_to_pretty;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SysError};
use crate::image::source_size;

/// Chunk size for image copies
pub const COPY_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Chunk size for bootloader payload writes
pub const BOOT_CHUNK_SIZE: usize = 1024 * 1024;

/// Minimum delay between two progress reports
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Receives status text and progress percentages while a copy runs
pub trait CopyObserver {
    fn status(&mut self, text: &str);
    fn progress(&mut self, percentage: f64);
}

impl CopyObserver for () {
    fn status(&mut self, _text: &str) {}
    fn progress(&mut self, _percentage: f64) {}
}

/// Attempts at opening a target that is still busy right after an unmount
const OPEN_ATTEMPTS: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Open an existing copy target for exclusive writing
///
/// Targets are never created, so a disk that vanished mid-job does not turn
/// into a regular file under `/dev`. Regular files are truncated, devices are not.
fn open_target(path: &Path) -> std::io::Result<File> {
    let mut attempt = 1;
    let file = loop {
        match exclusive_write().open(path) {
            Ok(file) => break file,
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < OPEN_ATTEMPTS => {
                debug!(
                    "{} is busy, retrying ({attempt}/{OPEN_ATTEMPTS})",
                    path.display()
                );
                attempt += 1;
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    };

    bypass_cache(&file);
    if file.metadata()?.is_file() {
        file.set_len(0)?;
    }
    Ok(file)
}

fn exclusive_write() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true);
    // Holding the lock keeps every other opener, the mounter included, off the node.
    #[cfg(target_os = "macos")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_EXLOCK);
    }
    options
}

#[cfg(target_os = "macos")]
fn bypass_cache(file: &File) {
    use std::os::fd::AsRawFd;

    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
        debug!("F_NOCACHE not applied: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "macos"))]
fn bypass_cache(_file: &File) {}

/// Copy the file at `source` onto `target` (typically a raw disk node)
///
/// Progress is reported at most every [`PROGRESS_INTERVAL`], and only when
/// the source size is known.
///
/// Returns the number of bytes copied.
pub fn copy_bytes(
    source: &Path,
    target: &Path,
    cancel: &CancellationToken,
    observer: &mut dyn CopyObserver,
) -> Result<u64> {
    observer.status("Opening image file...");
    let size = source_size(source);
    if size.is_none() {
        debug!("Size of {} is unknown, progress disabled", source.display());
    }
    let mut input = File::open(source).map_err(SysError::Read)?;

    observer.status("Opening target disk...");
    let mut output = open_target(target).map_err(SysError::Write)?;

    observer.status("Writing to disk...");
    observer.progress(0.0);

    let copied = copy_stream(
        &mut input,
        &mut output,
        size,
        COPY_CHUNK_SIZE,
        cancel,
        observer,
    )?;

    debug!(
        "Copied {} from {} to {}",
        bytes_to_pretty(&copied, true),
        source.display(),
        target.display()
    );
    Ok(copied)
}

/// Copy `source` into `target` in chunks of `chunk_size`
///
/// A failed read is [`SysError::Read`], a failed write [`SysError::Write`],
/// and a write that accepts fewer bytes than offered without failing is
/// [`SysError::OutOfSpace`].
pub fn copy_stream<R: Read, W: Write>(
    source: &mut R,
    target: &mut W,
    source_size: Option<u64>,
    chunk_size: usize,
    cancel: &CancellationToken,
    observer: &mut dyn CopyObserver,
) -> Result<u64> {
    let mut buffer = vec![0u8; chunk_size];
    let mut total_copied: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(SysError::Cancelled);
        }

        let bytes_read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SysError::Read(e)),
        };

        let written = loop {
            match target.write(&buffer[..bytes_read]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SysError::Write(e)),
            }
        };

        if written < bytes_read {
            return Err(SysError::OutOfSpace {
                written: total_copied + written as u64,
            });
        }

        total_copied += bytes_read as u64;

        if let Some(size) = source_size.filter(|size| *size > 0)
            && last_report.elapsed() >= PROGRESS_INTERVAL
        {
            last_report = Instant::now();
            let percentage = (total_copied as f64 / size as f64 * 100.0).min(100.0);
            observer.progress(percentage);
            observer.status(&format!(
                "Writing to disk... ({} of {})",
                bytes_to_pretty(&total_copied, false),
                bytes_to_pretty(&size, false)
            ));
        }
    }

    target.flush().map_err(SysError::Write)?;
    Ok(total_copied)
}

/// Write a small bootloader payload to a raw partition node
pub fn flash_boot_image(payload: &[u8], target: &Path, cancel: &CancellationToken) -> Result<()> {
    let mut output = open_target(target).map_err(SysError::Write)?;
    let mut input = payload;
    let written = copy_stream(
        &mut input,
        &mut output,
        None,
        BOOT_CHUNK_SIZE,
        cancel,
        &mut (),
    )?;
    debug!("Flashed {written} byte boot image to {}", target.display());
    Ok(())
}
