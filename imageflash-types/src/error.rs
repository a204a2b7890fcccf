// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a failed flashing job, as reported to the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperErrorKind {
    #[error("unknown error")]
    Unknown,
    #[error("the target disk could not be claimed")]
    ClaimError,
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("the image could not be read")]
    ReadError,
    #[error("the target disk could not be written")]
    WriteError,
    #[error("the target disk is too small for the image")]
    OutOfSpace,
}

impl HelperErrorKind {
    /// Stable numeric code used on the wire
    pub fn code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::ClaimError => 1,
            Self::Cancelled => 2,
            Self::ReadError => 3,
            Self::WriteError => 4,
            Self::OutOfSpace => 5,
        }
    }

    /// Unrecognised codes decode as [`HelperErrorKind::Unknown`].
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::ClaimError,
            2 => Self::Cancelled,
            3 => Self::ReadError,
            4 => Self::WriteError,
            5 => Self::OutOfSpace,
            _ => Self::Unknown,
        }
    }

    /// Cancellation follows an explicit user action and is not shown as an error.
    pub fn is_user_facing(self) -> bool {
        self != Self::Cancelled
    }
}
