//! Logged operations.
//!
//! Every mutation of engine state is expressed as one `LoggedOp` value.
//! The live path serializes the op, appends it to the WAL while holding
//! the session's operation lock, then applies it; replay decodes the same
//! bytes and runs them through the identical apply path. Because ID
//! assignment is a deterministic function of apply order, a replayed
//! session is byte-for-byte the session that was logged.

use gibram_durability::wal::WalRecordType;
use serde::{Deserialize, Serialize};

/// One durable mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoggedOp {
    AddDocument {
        session: String,
        external_id: String,
        filename: String,
    },
    AddTextUnit {
        session: String,
        external_id: String,
        document_id: u64,
        content: String,
        embedding: Option<Vec<f32>>,
        token_count: u32,
    },
    AddEntity {
        session: String,
        external_id: String,
        title: String,
        entity_type: String,
        description: String,
        embedding: Option<Vec<f32>>,
    },
    UpdateEntityDescription {
        session: String,
        id: u64,
        description: String,
        embedding: Option<Vec<f32>>,
    },
    AddRelationship {
        session: String,
        external_id: String,
        source: u64,
        target: u64,
        rel_type: String,
        description: String,
        weight: f32,
    },
    AddCommunity {
        session: String,
        external_id: String,
        title: String,
        summary: String,
        content: String,
        level: u32,
        entity_ids: Vec<u64>,
        relationship_ids: Vec<u64>,
        embedding: Option<Vec<f32>>,
    },
    LinkTextUnitToEntity {
        session: String,
        text_unit_id: u64,
        entity_id: u64,
    },
    DeleteDocument { session: String, id: u64 },
    DeleteTextUnit { session: String, id: u64 },
    DeleteEntity { session: String, id: u64 },
    DeleteRelationship { session: String, id: u64 },
    DeleteCommunity { session: String, id: u64 },
    DeleteSession { session: String },
    SetSessionTtl {
        session: String,
        ttl_secs: u64,
        idle_ttl_secs: u64,
    },
}

impl LoggedOp {
    /// The session this op belongs to.
    pub fn session(&self) -> &str {
        match self {
            LoggedOp::AddDocument { session, .. }
            | LoggedOp::AddTextUnit { session, .. }
            | LoggedOp::AddEntity { session, .. }
            | LoggedOp::UpdateEntityDescription { session, .. }
            | LoggedOp::AddRelationship { session, .. }
            | LoggedOp::AddCommunity { session, .. }
            | LoggedOp::LinkTextUnitToEntity { session, .. }
            | LoggedOp::DeleteDocument { session, .. }
            | LoggedOp::DeleteTextUnit { session, .. }
            | LoggedOp::DeleteEntity { session, .. }
            | LoggedOp::DeleteRelationship { session, .. }
            | LoggedOp::DeleteCommunity { session, .. }
            | LoggedOp::DeleteSession { session }
            | LoggedOp::SetSessionTtl { session, .. } => session,
        }
    }

    /// WAL record type this op is logged under.
    pub fn record_type(&self) -> WalRecordType {
        match self {
            LoggedOp::AddDocument { .. }
            | LoggedOp::AddTextUnit { .. }
            | LoggedOp::AddEntity { .. }
            | LoggedOp::AddRelationship { .. }
            | LoggedOp::AddCommunity { .. } => WalRecordType::Insert,
            LoggedOp::UpdateEntityDescription { .. }
            | LoggedOp::LinkTextUnitToEntity { .. }
            | LoggedOp::SetSessionTtl { .. } => WalRecordType::Update,
            LoggedOp::DeleteDocument { .. }
            | LoggedOp::DeleteTextUnit { .. }
            | LoggedOp::DeleteEntity { .. }
            | LoggedOp::DeleteRelationship { .. }
            | LoggedOp::DeleteCommunity { .. }
            | LoggedOp::DeleteSession { .. } => WalRecordType::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_bincode() {
        let op = LoggedOp::AddEntity {
            session: "s1".into(),
            external_id: "e1".into(),
            title: "ALPHA".into(),
            entity_type: "person".into(),
            description: "first".into(),
            embedding: Some(vec![0.1, 0.2]),
        };
        let bytes = bincode::serialize(&op).unwrap();
        let back: LoggedOp = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, op);
        assert_eq!(back.session(), "s1");
        assert_eq!(back.record_type(), WalRecordType::Insert);
    }

    #[test]
    fn test_record_types() {
        let delete = LoggedOp::DeleteEntity {
            session: "s".into(),
            id: 1,
        };
        assert_eq!(delete.record_type(), WalRecordType::Delete);

        let link = LoggedOp::LinkTextUnitToEntity {
            session: "s".into(),
            text_unit_id: 1,
            entity_id: 2,
        };
        assert_eq!(link.record_type(), WalRecordType::Update);
    }
}
