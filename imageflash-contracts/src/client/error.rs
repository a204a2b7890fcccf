// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Errors that can occur when talking to the helper
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Method call error: {0}")]
    MethodCall(String),

    #[error("Helper not available (is imageflash-helper running?)")]
    HelperNotAvailable,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl From<zbus::Error> for ClientError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::FDO(fdo_err) => match *fdo_err {
                zbus::fdo::Error::AccessDenied(msg) => ClientError::PermissionDenied(msg),
                other => ClientError::MethodCall(other.to_string()),
            },
            zbus::Error::MethodError(name, msg, _) => {
                let detail = msg.unwrap_or_default();
                if name.as_str().ends_with("AccessDenied") {
                    ClientError::PermissionDenied(detail)
                } else {
                    ClientError::MethodCall(format!("{name}: {detail}"))
                }
            }
            other => ClientError::Connection(other.to_string()),
        }
    }
}
