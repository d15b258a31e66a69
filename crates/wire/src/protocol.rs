//! Envelope, command and response types.
//!
//! The payload of every frame is a bincode-encoded `Envelope` carrying a
//! tagged-union `Command`; responses mirror it with `ResponseEnvelope` and
//! `Response`. Unknown command tags fail decoding and surface as protocol
//! errors, never panics.

use gibram_core::{Community, Document, Entity, Error, Relationship, Result, TextUnit};
use gibram_engine::backup::BackupStatus;
use gibram_engine::engine::{EngineInfo, SessionInfo};
use gibram_engine::query::{QueryResult, QuerySpec, QueryTrace};
use serde::{Deserialize, Serialize};

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// One request on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub request_id: u64,
    /// Target session; may be empty only for session-less commands.
    pub session_id: String,
    pub command: Command,
}

/// A batch entity for bulk inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub external_id: String,
    pub title: String,
    pub entity_type: String,
    pub description: String,
    pub embedding: Option<Vec<f32>>,
}

/// Every command the server understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    // Connection
    Auth { api_key: String },
    Ping,
    Health,
    Info,

    // Session lifecycle
    SessionList,
    SessionInfo,
    SessionDelete,
    SessionTouch,
    SessionSetTtl { ttl_secs: u64, idle_ttl_secs: u64 },

    // Documents
    AddDocument { external_id: String, filename: String },
    GetDocument { id: u64 },
    GetDocumentByExternal { external_id: String },
    DeleteDocument { id: u64 },

    // Text units
    AddTextUnit {
        external_id: String,
        document_id: u64,
        content: String,
        embedding: Option<Vec<f32>>,
        token_count: u32,
    },
    GetTextUnit { id: u64 },
    GetTextUnitByExternal { external_id: String },
    DeleteTextUnit { id: u64 },

    // Entities
    AddEntity {
        external_id: String,
        title: String,
        entity_type: String,
        description: String,
        embedding: Option<Vec<f32>>,
    },
    AddEntities { entities: Vec<EntitySpec> },
    GetEntity { id: u64 },
    GetEntities { ids: Vec<u64> },
    GetEntityByTitle { title: String },
    UpdateEntityDescription {
        id: u64,
        description: String,
        embedding: Option<Vec<f32>>,
    },
    DeleteEntity { id: u64 },
    ListEntities { after_id: u64, limit: u32 },

    // Relationships
    AddRelationship {
        external_id: String,
        source: u64,
        target: u64,
        rel_type: String,
        description: String,
        weight: f32,
    },
    GetRelationship { id: u64 },
    GetRelationshipBetween { source: u64, target: u64 },
    DeleteRelationship { id: u64 },
    ListRelationships { after_id: u64, limit: u32 },

    // Communities
    AddCommunity {
        external_id: String,
        title: String,
        summary: String,
        content: String,
        level: u32,
        entity_ids: Vec<u64>,
        relationship_ids: Vec<u64>,
        embedding: Option<Vec<f32>>,
    },
    GetCommunity { id: u64 },
    DeleteCommunity { id: u64 },
    ComputeCommunities { level: u32 },
    ComputeCommunityHierarchy { max_levels: u32 },

    // Graph
    LinkTextUnit { text_unit_id: u64, entity_id: u64 },
    GetNeighbors { entity_id: u64 },

    // Query
    Query { spec: QuerySpec },
    Explain { query_id: u64 },

    // Backup
    Save,
    BgSave,
    LastSave,
    BgRestore,
    BackupStatus,

    // WAL
    WalStatus,
    WalCheckpoint,
    WalTruncate { lsn: u64 },
    WalRotate,

    // Batching
    Pipeline { requests: Vec<Envelope> },
}

/// Every response the server produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Ok,
    Created { id: u64 },
    CreatedMany { ids: Vec<u64> },
    Error { message: String, code: i32 },

    Info(EngineInfo),
    Session(SessionInfo),
    Sessions(Vec<SessionInfo>),

    Document(Option<Document>),
    TextUnit(Option<TextUnit>),
    Entity(Option<Entity>),
    Entities {
        records: Vec<Entity>,
        next_cursor: u64,
    },
    Relationship(Option<Relationship>),
    Relationships {
        records: Vec<Relationship>,
        next_cursor: u64,
    },
    Community(Option<Community>),
    Neighbors(Vec<u64>),
    CommunityLevels(Vec<Vec<u64>>),

    Query(QueryResult),
    Explain(QueryTrace),

    Saved { path: String },
    LastSave { at_secs: u64 },
    Backup(BackupStatus),

    WalStatus {
        current_lsn: u64,
        flushed_lsn: u64,
        segment_count: u64,
        total_size: u64,
    },
    Checkpointed { lsn: u64 },
    Truncated { segments_removed: u64 },

    Health { ok: bool },
    Pipeline(Vec<ResponseEnvelope>),
}

impl Response {
    /// Build an error response from any engine error.
    pub fn from_error(error: &Error) -> Response {
        Response::Error {
            message: error.to_string(),
            code: error.code(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// One response on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub version: u32,
    pub request_id: u64,
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(request_id: u64, response: Response) -> Self {
        ResponseEnvelope {
            version: PROTOCOL_VERSION,
            request_id,
            response,
        }
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    bincode::serialize(envelope)
        .map_err(|e| Error::Protocol(format!("unencodable envelope: {e}")))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    bincode::deserialize(bytes).map_err(|e| Error::Protocol(format!("malformed envelope: {e}")))
}

pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Vec<u8>> {
    bincode::serialize(envelope)
        .map_err(|e| Error::Protocol(format!("unencodable response: {e}")))
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope> {
    bincode::deserialize(bytes).map_err(|e| Error::Protocol(format!("malformed response: {e}")))
}
