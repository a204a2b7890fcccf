// SPDX-License-Identifier: GPL-3.0-only

//! Authorization Services backend

use std::ffi::{CString, c_char, c_void};
use std::ptr;

use async_trait::async_trait;

use super::{AuthError, CREDENTIAL_LEN, PrivilegeAuthority};

type OSStatus = i32;
type AuthorizationRef = *mut c_void;

const ERR_AUTHORIZATION_SUCCESS: OSStatus = 0;

const FLAG_INTERACTION_ALLOWED: u32 = 1 << 0;
const FLAG_EXTEND_RIGHTS: u32 = 1 << 1;
const FLAG_DESTROY_RIGHTS: u32 = 1 << 3;

#[repr(C)]
struct AuthorizationExternalForm {
    bytes: [c_char; CREDENTIAL_LEN],
}

#[repr(C)]
struct AuthorizationItem {
    name: *const c_char,
    value_length: usize,
    value: *mut c_void,
    flags: u32,
}

#[repr(C)]
struct AuthorizationItemSet {
    count: u32,
    items: *mut AuthorizationItem,
}

#[link(name = "Security", kind = "framework")]
unsafe extern "C" {
    fn AuthorizationCreateFromExternalForm(
        ext_form: *const AuthorizationExternalForm,
        authorization: *mut AuthorizationRef,
    ) -> OSStatus;

    fn AuthorizationCopyRights(
        authorization: AuthorizationRef,
        rights: *const AuthorizationItemSet,
        environment: *const AuthorizationItemSet,
        flags: u32,
        authorized_rights: *mut *mut AuthorizationItemSet,
    ) -> OSStatus;

    fn AuthorizationFree(authorization: AuthorizationRef, flags: u32) -> OSStatus;
}

/// Frees the internalized reference, destroying any rights it acquired.
struct Authorization(AuthorizationRef);

impl Authorization {
    fn from_external(credential: &[u8; CREDENTIAL_LEN]) -> Result<Self, AuthError> {
        let form = AuthorizationExternalForm {
            bytes: credential.map(|b| b as c_char),
        };
        let mut reference: AuthorizationRef = ptr::null_mut();
        let status = unsafe { AuthorizationCreateFromExternalForm(&form, &mut reference) };
        if status != ERR_AUTHORIZATION_SUCCESS || reference.is_null() {
            return Err(AuthError::InvalidCredential(status));
        }
        Ok(Self(reference))
    }

    fn copy_right(&self, right: &str) -> Result<bool, AuthError> {
        let name = CString::new(right).map_err(|e| AuthError::Aborted(e.to_string()))?;
        let mut item = AuthorizationItem {
            name: name.as_ptr(),
            value_length: 0,
            value: ptr::null_mut(),
            flags: 0,
        };
        let rights = AuthorizationItemSet {
            count: 1,
            items: &mut item,
        };

        let status = unsafe {
            AuthorizationCopyRights(
                self.0,
                &rights,
                ptr::null(),
                FLAG_EXTEND_RIGHTS | FLAG_INTERACTION_ALLOWED,
                ptr::null_mut(),
            )
        };
        if status != ERR_AUTHORIZATION_SUCCESS {
            tracing::debug!("AuthorizationCopyRights({right}) returned {status}");
        }
        Ok(status == ERR_AUTHORIZATION_SUCCESS)
    }
}

impl Drop for Authorization {
    fn drop(&mut self) {
        unsafe {
            AuthorizationFree(self.0, FLAG_DESTROY_RIGHTS);
        }
    }
}

pub struct SecurityAuthority;

#[async_trait]
impl PrivilegeAuthority for SecurityAuthority {
    async fn authorize(
        &self,
        credential: &[u8; CREDENTIAL_LEN],
        right: &str,
    ) -> Result<bool, AuthError> {
        let credential = *credential;
        let right = right.to_string();

        // Copying rights may put up an authentication dialog and block for a
        // long time.
        tokio::task::spawn_blocking(move || {
            Authorization::from_external(&credential)?.copy_right(&right)
        })
        .await
        .map_err(|e| AuthError::Aborted(e.to_string()))?
    }
}
