// SPDX-License-Identifier: GPL-3.0-only

//! Shared domain types for the imageflash helper
//!
//! These types are used on both sides of the helper boundary:
//!
//! - **imageflash-helper**: validates incoming calls into these types and
//!   publishes [`HelperEvent`]s while a job runs
//! - **imageflash-sys**: reports failures as [`HelperErrorKind`]s
//! - **imageflash-contracts**: maps them to their D-Bus wire representation

pub mod common;
pub mod device;
pub mod error;
pub mod event;
pub mod permission;
pub mod request;

pub use common::bytes_to_pretty;
pub use device::{DEVICE_DIR, DeviceId, DeviceNode, InvalidDeviceId};
pub use error::HelperErrorKind;
pub use event::{HelperEvent, INDETERMINATE};
pub use permission::Permission;
pub use request::{
    EXFAT_LABEL_MAX, FlashMode, FlashRequest, InvalidSource, JobId, parse_source, volume_label,
};
