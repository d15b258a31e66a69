//! API keys and role-based access control.
//!
//! Permissions compose: admin ⇒ write ⇒ read. Every command maps to one
//! required permission; the check happens before the engine is touched.

use crate::protocol::Command;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a key is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    /// Whether this permission satisfies `required`.
    pub fn allows(self, required: Permission) -> bool {
        self >= required
    }

    pub fn parse(value: &str) -> Option<Permission> {
        match value {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

/// The configured API keys.
#[derive(Debug, Clone, Default)]
pub struct AuthTable {
    keys: HashMap<String, Permission>,
}

impl AuthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, permission: Permission) {
        self.keys.insert(key.into(), permission);
    }

    /// Look up a presented key.
    pub fn validate(&self, key: &str) -> Option<Permission> {
        self.keys.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The permission each command requires.
pub fn required_permission(command: &Command) -> Permission {
    match command {
        // Pre-auth; never reaches the RBAC check.
        Command::Auth { .. } => Permission::Read,

        Command::Ping
        | Command::Health
        | Command::Info
        | Command::SessionList
        | Command::SessionInfo
        | Command::GetDocument { .. }
        | Command::GetDocumentByExternal { .. }
        | Command::GetTextUnit { .. }
        | Command::GetTextUnitByExternal { .. }
        | Command::GetEntity { .. }
        | Command::GetEntities { .. }
        | Command::GetEntityByTitle { .. }
        | Command::ListEntities { .. }
        | Command::GetRelationship { .. }
        | Command::GetRelationshipBetween { .. }
        | Command::ListRelationships { .. }
        | Command::GetCommunity { .. }
        | Command::GetNeighbors { .. }
        | Command::Query { .. }
        | Command::Explain { .. }
        | Command::LastSave
        | Command::BackupStatus
        | Command::WalStatus
        | Command::Pipeline { .. } => Permission::Read,

        Command::SessionTouch
        | Command::AddDocument { .. }
        | Command::DeleteDocument { .. }
        | Command::AddTextUnit { .. }
        | Command::DeleteTextUnit { .. }
        | Command::AddEntity { .. }
        | Command::AddEntities { .. }
        | Command::UpdateEntityDescription { .. }
        | Command::DeleteEntity { .. }
        | Command::AddRelationship { .. }
        | Command::DeleteRelationship { .. }
        | Command::AddCommunity { .. }
        | Command::DeleteCommunity { .. }
        | Command::ComputeCommunities { .. }
        | Command::ComputeCommunityHierarchy { .. }
        | Command::LinkTextUnit { .. } => Permission::Write,

        Command::SessionDelete
        | Command::SessionSetTtl { .. }
        | Command::Save
        | Command::BgSave
        | Command::BgRestore
        | Command::WalCheckpoint
        | Command::WalTruncate { .. }
        | Command::WalRotate => Permission::Admin,
    }
}

/// Whether the command mutates and therefore needs a non-empty session ID.
pub fn requires_session(command: &Command) -> bool {
    matches!(
        command,
        Command::SessionTouch
            | Command::SessionDelete
            | Command::SessionSetTtl { .. }
            | Command::AddDocument { .. }
            | Command::DeleteDocument { .. }
            | Command::AddTextUnit { .. }
            | Command::DeleteTextUnit { .. }
            | Command::AddEntity { .. }
            | Command::AddEntities { .. }
            | Command::UpdateEntityDescription { .. }
            | Command::DeleteEntity { .. }
            | Command::AddRelationship { .. }
            | Command::DeleteRelationship { .. }
            | Command::AddCommunity { .. }
            | Command::DeleteCommunity { .. }
            | Command::ComputeCommunities { .. }
            | Command::ComputeCommunityHierarchy { .. }
            | Command::LinkTextUnit { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_compose() {
        assert!(Permission::Admin.allows(Permission::Read));
        assert!(Permission::Admin.allows(Permission::Write));
        assert!(Permission::Write.allows(Permission::Read));
        assert!(!Permission::Write.allows(Permission::Admin));
        assert!(!Permission::Read.allows(Permission::Write));
        assert!(Permission::Read.allows(Permission::Read));
    }

    #[test]
    fn test_parse() {
        assert_eq!(Permission::parse("admin"), Some(Permission::Admin));
        assert_eq!(Permission::parse("write"), Some(Permission::Write));
        assert_eq!(Permission::parse("read"), Some(Permission::Read));
        assert_eq!(Permission::parse("root"), None);
    }

    #[test]
    fn test_command_mapping() {
        assert_eq!(required_permission(&Command::Ping), Permission::Read);
        assert_eq!(
            required_permission(&Command::DeleteEntity { id: 1 }),
            Permission::Write
        );
        assert_eq!(required_permission(&Command::Save), Permission::Admin);
        assert_eq!(
            required_permission(&Command::WalTruncate { lsn: 5 }),
            Permission::Admin
        );
    }

    #[test]
    fn test_requires_session() {
        assert!(requires_session(&Command::AddDocument {
            external_id: "d".into(),
            filename: "f".into()
        }));
        assert!(!requires_session(&Command::Info));
        assert!(!requires_session(&Command::Query {
            spec: Default::default()
        }));
    }

    #[test]
    fn test_auth_table() {
        let mut table = AuthTable::new();
        table.insert("secret", Permission::Write);
        assert_eq!(table.validate("secret"), Some(Permission::Write));
        assert_eq!(table.validate("wrong"), None);
    }
}
