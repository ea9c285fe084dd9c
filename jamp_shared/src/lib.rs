//! `jamp_shared`
//!
//! Shared libraries used by the server, the game module and the client.
//!
//! Design goals:
//! - Fixed protocol limits live in one place (`limits`).
//! - Module boundaries are explicit call tables (`game_api`) owned by a
//!   slot registry (`vm`), never raw function pointers.
//! - Wire messages are serde types; entity/player state travel as deltas.
//! - No `unsafe`.

pub mod config;
pub mod console;
pub mod entity_state;
pub mod fixed;
pub mod game_api;
pub mod info;
pub mod limits;
pub mod math;
pub mod net;
pub mod parse;
pub mod persist;
pub mod reliable;
pub mod vm;

