//! Headless client game.
//!
//! Stands in the `cgame` slot when nothing draws: it accepts the module
//! calls and logs what a presentation layer would act on.

use tracing::{debug, info};

use jamp_shared::game_api::CGameExport;
use jamp_shared::vm::{Module, VmError};

#[derive(Debug, Default)]
pub struct HeadlessCGame {
    client_num: usize,
    frames: u64,
}

impl CGameExport for HeadlessCGame {
    fn init(&mut self, server_message_num: i32, server_command_sequence: i32, client_num: usize) {
        self.client_num = client_num;
        self.frames = 0;
        info!(
            target: "cgame",
            server_message_num, server_command_sequence, client_num, "CG_Init"
        );
    }

    fn shutdown(&mut self) {
        debug!(target: "cgame", frames = self.frames, "CG_Shutdown");
    }

    fn console_command(&mut self, args: &[String]) -> bool {
        match args.first().map(String::as_str) {
            Some("scores") | Some("tinfo") | Some("cp") => {
                debug!(target: "cgame", args = ?args, "server command");
                true
            }
            _ => false,
        }
    }

    fn draw_active_frame(&mut self, server_time: i32) {
        self.frames += 1;
        if self.frames % 200 == 0 {
            debug!(target: "cgame", server_time, frames = self.frames, "frame");
        }
    }
}

/// Loader for the `cgame` slot.
pub fn load(name: &str) -> Result<Module, VmError> {
    match name {
        "cgame" => Ok(Module::CGame(Box::<HeadlessCGame>::default())),
        other => Err(VmError::NotFound(other.to_string())),
    }
}
