// SPDX-License-Identifier: GPL-3.0-only

use crate::HelperErrorKind;

/// Progress value sent while the current step has no measurable progress.
pub const INDETERMINATE: f64 = f64::NAN;

/// Event pushed to the subscribed caller while a job runs
#[derive(Debug, Clone, PartialEq)]
pub enum HelperEvent {
    StatusChanged(String),
    /// Percentage in `0.0..=100.0`, or [`INDETERMINATE`]
    ProgressChanged(f64),
    Finished,
    Failed(HelperErrorKind),
}

impl HelperEvent {
    /// True for events that end a job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_))
    }
}
