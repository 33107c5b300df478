//! Operations the daemon can run and how they exclude each other.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A long-running, system-mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    FactoryReset,
    ManualUpdate,
    RebootUpdate,
    LiveUpdate,
    Backup,
    Restore,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::FactoryReset,
        Operation::ManualUpdate,
        Operation::RebootUpdate,
        Operation::LiveUpdate,
        Operation::Backup,
        Operation::Restore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FactoryReset => "factory_reset",
            Self::ManualUpdate => "manual_update",
            Self::RebootUpdate => "reboot_update",
            Self::LiveUpdate => "live_update",
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    /// Members of the update group are pairwise exclusive.
    pub fn is_update_group(&self) -> bool {
        matches!(
            self,
            Self::FactoryReset | Self::ManualUpdate | Self::RebootUpdate | Self::LiveUpdate
        )
    }

    /// Operations that leave a script in the boot-action slot.
    pub fn stages_boot_action(&self) -> bool {
        matches!(
            self,
            Self::FactoryReset | Self::ManualUpdate | Self::RebootUpdate | Self::Restore
        )
    }

    /// Whether `self` and `other` may not be in flight at the same time.
    ///
    /// Backup and Restore each conflict with the update group and with
    /// themselves, but not with each other.
    pub fn conflicts_with(&self, other: Operation) -> bool {
        if *self == other {
            return true;
        }
        if self.is_update_group() || other.is_update_group() {
            return true;
        }
        false
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a leased operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum Outcome {
    Succeeded,
    Failed(String),
    Aborted,
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_group_is_pairwise_exclusive() {
        let group = [
            Operation::FactoryReset,
            Operation::ManualUpdate,
            Operation::RebootUpdate,
            Operation::LiveUpdate,
        ];
        for a in group {
            for b in group {
                assert!(a.conflicts_with(b), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_backup_and_restore_are_independent() {
        assert!(!Operation::Backup.conflicts_with(Operation::Restore));
        assert!(!Operation::Restore.conflicts_with(Operation::Backup));
        assert!(Operation::Backup.conflicts_with(Operation::Backup));
        assert!(Operation::Restore.conflicts_with(Operation::LiveUpdate));
        assert!(Operation::FactoryReset.conflicts_with(Operation::Backup));
    }

    #[test]
    fn test_conflict_relation_is_symmetric() {
        for a in Operation::ALL {
            for b in Operation::ALL {
                assert_eq!(a.conflicts_with(b), b.conflicts_with(a));
            }
        }
    }
}
