//! Lifecycle status shared by identities, devices and oplogs.

use serde::{Deserialize, Serialize};

/// Status of an identity, a device (MyNode) or an oplog.
///
/// Variants are ordered: a record only ever moves to a greater status.
/// The first device of an identity goes `Pending -> Alive`; a joining
/// device goes `Init -> InternalPending -> Sync -> Alive`. `Migrated`,
/// `Deleted` and `Revoked` are terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Invalid,
    Init,
    InternalPending,
    Pending,
    Sync,
    Alive,
    Migrated,
    Deleted,
    Revoked,
}

impl Status {
    /// Whether the record is gone for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Migrated | Status::Deleted | Status::Revoked)
    }

    /// `Sync` or `Alive`: the device participates in consensus traffic.
    pub fn is_synced(self) -> bool {
        matches!(self, Status::Sync | Status::Alive)
    }

    /// The status after a transition to `next`; never regresses.
    pub fn advance(self, next: Status) -> Status {
        self.max(next)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Invalid => "invalid",
            Status::Init => "init",
            Status::InternalPending => "internal_pending",
            Status::Pending => "pending",
            Status::Sync => "sync",
            Status::Alive => "alive",
            Status::Migrated => "migrated",
            Status::Deleted => "deleted",
            Status::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order() {
        assert!(Status::Init < Status::InternalPending);
        assert!(Status::InternalPending < Status::Pending);
        assert!(Status::Pending < Status::Sync);
        assert!(Status::Sync < Status::Alive);
        assert!(Status::Alive < Status::Deleted);
    }

    #[test]
    fn test_advance_never_regresses() {
        assert_eq!(Status::Alive.advance(Status::Init), Status::Alive);
        assert_eq!(Status::Init.advance(Status::Sync), Status::Sync);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Status::InternalPending).expect("serialize");
        assert_eq!(json, "\"internal_pending\"");
    }
}
