// SPDX-License-Identifier: GPL-3.0-only

//! Formatting helpers shared by status messages and logs

use num_format::{Locale, ToFormattedString};

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Convert bytes to human-readable format (e.g., "1.50 GB")
///
/// With `add_bytes` the exact byte count is appended, which is what the
/// helper logs; status lines sent to the front end use the short form.
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut value = *bytes as f64;
    let mut unit = 0;
    while value > 1024. && unit + 1 < UNITS.len() {
        value /= 1024.;
        unit += 1;
    }

    let short = format!("{value:.2} {}", UNITS[unit]);
    if add_bytes {
        format!("{short} ({} bytes)", bytes.to_formatted_string(&Locale::en))
    } else {
        short
    }
}
