// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for image flashing
//!
//! This crate holds the byte-moving half of the helper:
//! - Chunked image copies with progress and cancellation
//! - Recursive tree copies for installer media
//! - Bootloader payload writes to raw device nodes
//! - Wrappers around the partitioning and image-mounting tools
//!
//! Everything here is blocking and meant to run on the helper's job thread.

pub mod copy;
pub mod error;
pub mod image;
pub mod tools;
pub mod tree;

pub use copy::{
    BOOT_CHUNK_SIZE, COPY_CHUNK_SIZE, CopyObserver, PROGRESS_INTERVAL, copy_bytes, copy_stream,
    flash_boot_image,
};
pub use error::{Result, SysError};
pub use image::{detect_windows_image, load_boot_image, source_size};
pub use tools::{Tools, parse_attach_output};
pub use tree::{WHOLE_FILE_THRESHOLD, copy_tree};
