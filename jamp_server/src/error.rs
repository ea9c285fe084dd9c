//! Server error types.

use thiserror::Error;

use jamp_shared::game_api::GameError;
use jamp_shared::reliable::ChannelError;
use jamp_shared::vm::VmError;

/// Failures that abort a level load or restart. The server is left DEAD.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Can't find map {0}")]
    MapNotFound(String),
    #[error("illegal map name {0:?}")]
    BadMapName(String),
    #[error("VM_Create on game failed")]
    NoGame,
    #[error("game is version {got}, expected {expected}")]
    GameVersion { got: i32, expected: i32 },
    #[error("Server is not running.")]
    NotRunning,
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single client is being removed. The session continues for
/// everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("disconnected")]
    Disconnected,
    #[error("timed out")]
    TimedOut,
    #[error("was kicked")]
    Kicked,
    #[error("illegible client message")]
    Illegible,
    #[error("{0}")]
    Channel(#[from] ChannelError),
    #[error("{0}")]
    Game(String),
}
