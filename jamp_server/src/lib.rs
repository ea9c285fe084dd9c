//! `jamp_server`
//!
//! Authoritative dedicated server:
//! - challenge/connect handshake and client slots
//! - reliable server commands and configstrings
//! - per-client delta-compressed snapshots
//! - hosting the game module through `GameImport`
//! - map load, `map_restart` and operator commands
//!
//! Everything is driven from one frame loop over a UDP socket.

pub mod access;
pub mod client;
pub mod download;
pub mod error;
pub mod host;
pub mod server;
pub mod snapshot;
pub mod world;

pub use error::{DropReason, ServerError};
pub use host::ServerState;
pub use server::{bind_ephemeral, GameServer};
