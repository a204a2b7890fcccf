// SPDX-License-Identifier: GPL-3.0-only

//! Per-call authorization
//!
//! Every privileged call carries an externalized authorization credential
//! from the front end. It is checked against one right per call; nothing is
//! cached between calls.

use std::sync::Arc;

use async_trait::async_trait;
use imageflash_types::Permission;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(target_os = "macos")]
mod macos;

/// Size of an externalized authorization credential
pub const CREDENTIAL_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential rejected by the authority (status {0})")]
    InvalidCredential(i32),

    #[error("authorization is not available on this platform")]
    PlatformNotSupported,

    #[error("authorization check did not complete: {0}")]
    Aborted(String),
}

/// The platform service that grants rights to a credential
#[async_trait]
pub trait PrivilegeAuthority: Send + Sync {
    /// Whether `credential` holds `right`, asking the user if needed.
    async fn authorize(
        &self,
        credential: &[u8; CREDENTIAL_LEN],
        right: &str,
    ) -> Result<bool, AuthError>;
}

/// Authority for the platform the helper was built for.
pub fn platform_authority() -> Arc<dyn PrivilegeAuthority> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::SecurityAuthority)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(DenyAll)
    }
}

/// Rejects every request
#[cfg(not(target_os = "macos"))]
struct DenyAll;

#[cfg(not(target_os = "macos"))]
#[async_trait]
impl PrivilegeAuthority for DenyAll {
    async fn authorize(
        &self,
        _credential: &[u8; CREDENTIAL_LEN],
        _right: &str,
    ) -> Result<bool, AuthError> {
        Err(AuthError::PlatformNotSupported)
    }
}

pub struct AuthorizationGate {
    authority: Arc<dyn PrivilegeAuthority>,
    identifier: String,
}

impl AuthorizationGate {
    pub fn new(authority: Arc<dyn PrivilegeAuthority>, identifier: impl Into<String>) -> Self {
        Self {
            authority,
            identifier: identifier.into(),
        }
    }

    /// Whether `credential` grants `permission`; any failure denies.
    pub async fn check(&self, credential: &[u8], permission: Permission) -> bool {
        let Ok(credential) = <&[u8; CREDENTIAL_LEN]>::try_from(credential) else {
            warn!(
                "Rejecting {} request: credential is {} bytes",
                permission.suffix(),
                credential.len()
            );
            return false;
        };

        let right = permission.right_name(&self.identifier);
        match self.authority.authorize(credential, &right).await {
            Ok(granted) => {
                debug!("Authorization for {right}: granted={granted}");
                granted
            }
            Err(e) => {
                warn!("Authorization for {right} failed: {e}");
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{StaticAuthority, VALID};
    use super::*;

    fn gate(authority: &Arc<StaticAuthority>) -> AuthorizationGate {
        AuthorizationGate::new(authority.clone(), "org.imageflash.helper")
    }

    #[tokio::test]
    async fn wrong_length_is_rejected_without_asking() {
        let authority = StaticAuthority::granting(&Permission::ALL);
        let gate = gate(&authority);

        assert!(!gate.check(&[7; 31], Permission::Write).await);
        assert!(!gate.check(&[7; 33], Permission::Write).await);
        assert!(!gate.check(&[], Permission::Write).await);
        assert!(authority.checked().is_empty());
    }

    #[tokio::test]
    async fn each_call_checks_its_own_right() {
        let authority = StaticAuthority::granting(&[Permission::Subscribe]);
        let gate = gate(&authority);

        assert!(gate.check(&VALID, Permission::Subscribe).await);
        assert!(!gate.check(&VALID, Permission::Write).await);
        assert!(gate.check(&VALID, Permission::Subscribe).await);
        assert_eq!(
            authority.checked(),
            [
                "org.imageflash.helper.subscribe",
                "org.imageflash.helper.write",
                "org.imageflash.helper.subscribe",
            ]
        );
    }

    #[tokio::test]
    async fn authority_errors_deny() {
        let authority = StaticAuthority::granting(&Permission::ALL);
        let gate = gate(&authority);

        assert!(!gate.check(&[0; CREDENTIAL_LEN], Permission::Cancel).await);
    }
}
