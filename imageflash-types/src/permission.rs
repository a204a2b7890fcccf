// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Rights checked independently on every privileged call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Write,
    Cancel,
    Subscribe,
    Stop,
    Eject,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::Write,
        Permission::Cancel,
        Permission::Subscribe,
        Permission::Stop,
        Permission::Eject,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Cancel => "cancel",
            Self::Subscribe => "subscribe",
            Self::Stop => "stop",
            Self::Eject => "eject",
        }
    }

    /// Right name registered with the platform authority, e.g. `org.imageflash.helper.write`
    pub fn right_name(self, identifier: &str) -> String {
        format!("{identifier}.{}", self.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_names_are_prefixed_with_identifier() {
        let names: Vec<String> = Permission::ALL
            .iter()
            .map(|p| p.right_name("org.imageflash.helper"))
            .collect();
        assert_eq!(
            names,
            [
                "org.imageflash.helper.write",
                "org.imageflash.helper.cancel",
                "org.imageflash.helper.subscribe",
                "org.imageflash.helper.stop",
                "org.imageflash.helper.eject",
            ]
        );
    }
}
