//! `jamp_client`
//!
//! Remote end of the server protocol:
//! - challenge/connect handshake
//! - gamestate and configstring tracking
//! - snapshot reconstruction against a ring of received frames
//! - in-order execution and acknowledgement of server commands
//! - usercmd generation and file downloads
//!
//! Presentation is left to the `cgame` module; a headless one is bundled.

pub mod cgame;
pub mod client;
pub mod download;
pub mod input;
pub mod interp;
pub mod session;
pub mod snapshot;

pub use client::GameClient;
pub use session::{ClientSession, ConnState};
