// SPDX-License-Identifier: GPL-3.0-only

//! Names and signal encoding shared by the helper and its clients

use imageflash_types::{HelperErrorKind, HelperEvent};
use zbus::message::Type as MessageType;
use zbus::Message;

pub const HELPER_INTERFACE: &str = "org.imageflash.Helper1";
pub const HELPER_PATH: &str = "/org/imageflash/Helper";
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/imageflash-helper.sock";

pub const SIGNAL_STATUS_CHANGED: &str = "StatusChanged";
pub const SIGNAL_PROGRESS_CHANGED: &str = "ProgressChanged";
pub const SIGNAL_FINISHED: &str = "Finished";
pub const SIGNAL_FAILED: &str = "Failed";

/// Decode a helper signal into the event it carries.
///
/// Returns `None` for method calls, replies and signals of other interfaces.
pub fn decode_event(message: &Message) -> Option<HelperEvent> {
    if message.message_type() != MessageType::Signal {
        return None;
    }

    let header = message.header();
    if header.interface().map(|i| i.as_str()) != Some(HELPER_INTERFACE) {
        return None;
    }

    let body = message.body();
    match header.member()?.as_str() {
        SIGNAL_STATUS_CHANGED => body.deserialize::<String>().ok().map(HelperEvent::StatusChanged),
        SIGNAL_PROGRESS_CHANGED => body.deserialize::<f64>().ok().map(HelperEvent::ProgressChanged),
        SIGNAL_FINISHED => Some(HelperEvent::Finished),
        SIGNAL_FAILED => body
            .deserialize::<u32>()
            .ok()
            .map(|code| HelperEvent::Failed(HelperErrorKind::from_code(code))),
        _ => None,
    }
}
