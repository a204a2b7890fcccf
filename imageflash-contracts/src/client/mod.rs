// SPDX-License-Identifier: GPL-3.0-only

//! Client side of the helper socket

pub mod error;
pub mod helper;

pub use error::ClientError;
pub use helper::{HelperClient, HelperInterfaceProxy};
