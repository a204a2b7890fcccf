// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;
use zbus::fdo;

use crate::arbitration::ArbitrationError;
use crate::config::ConfigError;

/// Helper-level errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("D-Bus error: {0}")]
    DBus(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Disk arbitration: {0}")]
    Arbitration(#[from] ArbitrationError),

    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("System tools: {0}")]
    Sys(#[from] imageflash_sys::SysError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ServiceError> for fdo::Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::AuthorizationFailed(msg) => fdo::Error::AccessDenied(msg),
            ServiceError::InvalidArgument(msg) => fdo::Error::InvalidArgs(msg),
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}

impl From<zbus::Error> for ServiceError {
    fn from(err: zbus::Error) -> Self {
        ServiceError::DBus(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_failures_become_access_denied() {
        let err: fdo::Error = ServiceError::AuthorizationFailed("subscribe".into()).into();
        assert!(matches!(err, fdo::Error::AccessDenied(_)));
    }

    #[test]
    fn other_failures_are_generic() {
        let err: fdo::Error = ServiceError::DBus("connection reset".into()).into();
        assert!(matches!(err, fdo::Error::Failed(_)));
    }
}
