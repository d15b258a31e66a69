//! Engine layer for gibram.
//!
//! Owns the in-memory data model and everything that operates on it:
//!
//! - **session**: per-session typed tables, secondary maps, adjacency and
//!   the three vector indices, all behind one reader/writer lock
//! - **ops**: the serializable logged-operation vocabulary; mutations go
//!   WAL-first and replay deterministically
//! - **engine**: the session registry, lazy creation, TTL sweeper and
//!   snapshot emission/restore
//! - **query**: hybrid ANN + k-hop pipeline with EXPLAIN traces
//! - **community**: the pluggable clustering contract and default detector
//! - **backup**: blocking and background backup orchestration plus
//!   recovery wiring

pub mod backup;
pub mod community;
pub mod engine;
pub mod ops;
pub mod query;
pub mod session;

pub use backup::{run_recovery, BackupManager, BackupStatus};
pub use community::{CommunityDetector, CommunityDraft, ConnectedComponents, GraphView};
pub use engine::{Engine, EngineConfig, EngineInfo, OpOutcome, SessionInfo};
pub use ops::LoggedOp;
pub use query::{
    QueryPlanner, QueryResult, QuerySpec, QueryTrace, SearchKind, SeedHit, TraversalStep,
};
pub use session::{SessionCounts, SessionSnapshot, SessionStore};
