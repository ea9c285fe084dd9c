//! Module call tables.
//!
//! Each module kind exposes an export trait (engine → module). The server game
//! additionally receives a `GameImport` (module → engine) on every call; that
//! borrow is the only way back into the engine, so a syscall can never reach
//! the module that is currently running.

use bytes::Bytes;
use thiserror::Error;

use crate::console::CvarFlags;
use crate::entity_state::{PlayerState, SharedEntity, UserCmd};
use crate::fixed::CapacityError;

/// API version a game module must report.
pub const GAME_API_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GameError {
    /// `G_Error`: the level cannot continue.
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
}

/// Engine services available to the server game.
pub trait GameImport {
    fn print(&mut self, msg: &str);
    /// Server time in milliseconds.
    fn milliseconds(&self) -> i32;

    fn cvar_register(&mut self, name: &str, default: &str, flags: CvarFlags);
    fn cvar_string(&self, name: &str) -> String;
    fn cvar_int(&self, name: &str) -> i64;
    fn cvar_set(&mut self, name: &str, value: &str);

    fn get_configstring(&self, index: usize) -> String;
    fn set_configstring(&mut self, index: usize, value: &str);
    fn get_serverinfo(&self) -> String;
    fn get_userinfo(&self, client: usize) -> String;
    fn set_userinfo(&mut self, client: usize, info: &str);

    /// Next token of the entity text being spawned.
    fn get_entity_token(&mut self) -> Option<String>;
    /// Switches the entity parse point to a sub-map's entities (`None` returns
    /// to the main map). Returns false when the sub-map has no entity text.
    fn set_active_sub_bsp(&mut self, name: Option<&str>) -> bool;
    /// Snapshot distance-cull radius.
    fn set_server_cull(&mut self, distance: f32);

    fn link_entity(&mut self, ent: &mut SharedEntity);
    fn unlink_entity(&mut self, ent: &mut SharedEntity);

    /// Queues a reliable command for one client, or all when `None`.
    fn send_server_command(&mut self, client: Option<usize>, text: &str);
    fn drop_client(&mut self, client: usize, reason: &str);

    /// Arguments of the command being executed.
    fn argc(&self) -> usize;
    fn argv(&self, n: usize) -> String;

    fn pd_store(&mut self, name: &str, data: Bytes) -> bool;
    fn pd_load(&mut self, name: &str) -> Option<Bytes>;
}

/// Server game entry points.
pub trait GameExport: Send {
    fn api_version(&self) -> i32 {
        GAME_API_VERSION
    }

    fn init_game(
        &mut self,
        sys: &mut dyn GameImport,
        level_time: i32,
        random_seed: i32,
        restart: bool,
    ) -> Result<(), GameError>;
    fn shutdown_game(&mut self, sys: &mut dyn GameImport, restart: bool);

    /// Returns a denial reason, or `None` to accept.
    fn client_connect(
        &mut self,
        sys: &mut dyn GameImport,
        client: usize,
        first_time: bool,
        is_bot: bool,
    ) -> Option<String>;
    fn client_begin(&mut self, sys: &mut dyn GameImport, client: usize);
    fn client_userinfo_changed(&mut self, sys: &mut dyn GameImport, client: usize);
    fn client_disconnect(&mut self, sys: &mut dyn GameImport, client: usize);
    /// Arguments are read through `argc`/`argv`.
    fn client_command(&mut self, sys: &mut dyn GameImport, client: usize);
    fn client_think(&mut self, sys: &mut dyn GameImport, client: usize, cmd: &UserCmd);
    fn run_frame(&mut self, sys: &mut dyn GameImport, level_time: i32) -> Result<(), GameError>;
    /// Returns whether the game handled the command.
    fn console_command(&mut self, sys: &mut dyn GameImport) -> bool;

    /// One past the highest entity number in use.
    fn num_entities(&self) -> usize;
    fn shared_entity(&self, num: usize) -> Option<&SharedEntity>;
    fn player_state(&self, client: usize) -> Option<&PlayerState>;
}

/// Client game entry points.
pub trait CGameExport: Send {
    fn init(&mut self, server_message_num: i32, server_command_sequence: i32, client_num: usize);
    fn shutdown(&mut self);
    /// Returns whether the command was consumed.
    fn console_command(&mut self, args: &[String]) -> bool;
    fn draw_active_frame(&mut self, server_time: i32);
}

/// UI entry points.
pub trait UiExport: Send {
    fn init(&mut self, in_game_load: bool);
    fn shutdown(&mut self);
    fn console_command(&mut self, args: &[String]) -> bool;
    fn refresh(&mut self, real_time: i32);
}
