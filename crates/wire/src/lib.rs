//! Wire protocol server for gibram.
//!
//! Messages are framed as `codec u8 | length u32 big-endian | payload`;
//! codec 1 carries a bincode-encoded envelope. The server authenticates
//! connections, enforces role-based permissions and per-key rate limits,
//! and routes commands into the engine.

pub mod auth;
pub mod frame;
pub mod protocol;
pub mod ratelimit;
pub mod server;

pub use auth::{required_permission, AuthTable, Permission};
pub use frame::{read_frame, write_frame, CODEC_BINCODE, DEFAULT_MAX_FRAME_SIZE};
pub use protocol::{
    decode_envelope, decode_response, encode_envelope, encode_response, Command, Envelope,
    EntitySpec, Response, ResponseEnvelope, PROTOCOL_VERSION,
};
pub use ratelimit::{RateLimitConfig, RateLimiterRegistry};
pub use server::{Server, ServerContext, WireConfig};
