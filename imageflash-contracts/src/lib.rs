// SPDX-License-Identifier: GPL-3.0-only

pub mod client;
pub mod protocol;

pub use client::{ClientError, HelperClient, HelperInterfaceProxy};
pub use protocol::{
    DEFAULT_SOCKET_PATH, HELPER_INTERFACE, HELPER_PATH, decode_event,
};
