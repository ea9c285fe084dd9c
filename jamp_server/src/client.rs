//! Per-connection state.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use jamp_shared::entity_state::{EntityState, PlayerState, UserCmd};
use jamp_shared::info::{clean_name, value_for_key};
use jamp_shared::limits::{MAX_NAME_LENGTH, PACKET_BACKUP};
use jamp_shared::net::Netchan;
use jamp_shared::parse::atoi;
use jamp_shared::reliable::{CommandWindow, ReliableCommands};

use crate::download::Download;

/// Connection progress. Only moves forward, except a drop which goes to
/// `Zombie` and then `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ClientState {
    /// Slot can be reused.
    #[default]
    Free,
    /// Dropped; kept a while so late packets are not taken for a new
    /// connection.
    Zombie,
    /// Accepted by the game, waiting for the gamestate.
    Connected,
    /// Gamestate sent, waiting for the first usercmd of this level.
    Primed,
    Active,
}

/// What was sent in one outgoing message, kept for delta reference.
#[derive(Debug, Clone, Default)]
pub struct ClientFrame {
    pub message_num: i32,
    pub server_time: i32,
    pub ps: PlayerState,
    /// Sorted by entity number.
    pub entities: Vec<EntityState>,
    /// Server time the message left.
    pub sent_at: i32,
    pub acked_at: Option<i32>,
    pub size: usize,
}

#[derive(Debug)]
pub struct Client {
    pub state: ClientState,
    pub name: String,
    pub userinfo: String,
    pub netchan: Netchan,
    pub challenge: i32,

    /// Server → client commands.
    pub reliable: ReliableCommands,
    /// Client → server commands already executed.
    pub commands: CommandWindow,
    pub last_command_text: String,

    /// Last message number the client reported receiving.
    pub message_acknowledge: i32,
    /// Reference frame requested for the next snapshot.
    pub delta_message: Option<i32>,
    pub frames: Vec<ClientFrame>,
    pub gamestate_message_num: i32,
    /// Configstrings changed while the client was still loading.
    pub pending_configstrings: BTreeSet<usize>,

    pub last_usercmd: UserCmd,
    pub last_packet_time: i32,
    pub last_connect_time: i32,
    pub next_snapshot_time: i32,
    pub rate_delayed: bool,
    pub zombie_since: i32,
    pub ping: i32,

    /// Bytes per second.
    pub rate: i32,
    pub snapshot_msec: i32,

    pub download: Option<Download>,
}

impl Client {
    pub fn new(addr: SocketAddr, qport: u16, challenge: i32, userinfo: String, time: i32) -> Self {
        Self {
            state: ClientState::Connected,
            name: String::new(),
            userinfo,
            netchan: Netchan::new(addr, qport),
            challenge,
            reliable: ReliableCommands::new(),
            commands: CommandWindow::default(),
            last_command_text: String::new(),
            message_acknowledge: 0,
            delta_message: None,
            frames: vec![ClientFrame::default(); PACKET_BACKUP],
            gamestate_message_num: -1,
            pending_configstrings: BTreeSet::new(),
            last_usercmd: UserCmd::default(),
            last_packet_time: time,
            last_connect_time: time,
            next_snapshot_time: time,
            rate_delayed: false,
            zombie_since: 0,
            ping: 0,
            rate: 3000,
            snapshot_msec: 50,
            download: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.netchan.remote
    }

    /// `SV_UserinfoChanged`: name, rate and snapshot interval from userinfo.
    pub fn apply_userinfo(&mut self, max_rate: i32, sv_fps: i32) {
        let mut name = clean_name(value_for_key(&self.userinfo, "name"));
        name.truncate(MAX_NAME_LENGTH - 1);
        self.name = name;

        let rate = atoi(value_for_key(&self.userinfo, "rate"));
        self.rate = if rate > 0 {
            let rate = rate.max(1000);
            if max_rate > 0 {
                rate.min(max_rate)
            } else {
                rate
            }
        } else {
            3000
        };

        let snaps = value_for_key(&self.userinfo, "snaps");
        let snaps = if snaps.is_empty() { 20 } else { atoi(snaps) };
        self.snapshot_msec = 1000 / snaps.clamp(1, sv_fps.max(1));
    }

    pub fn frame(&self, message_num: i32) -> &ClientFrame {
        &self.frames[message_num as usize % PACKET_BACKUP]
    }

    pub fn frame_mut(&mut self, message_num: i32) -> &mut ClientFrame {
        &mut self.frames[message_num as usize % PACKET_BACKUP]
    }

    /// Clears everything tied to the previous level.
    pub fn reset_for_new_level(&mut self) {
        self.state = ClientState::Connected;
        self.delta_message = None;
        self.gamestate_message_num = -1;
        self.frames.iter_mut().for_each(|f| *f = ClientFrame::default());
        self.pending_configstrings.clear();
        self.last_usercmd = UserCmd::default();
        self.download = None;
    }

    /// Whether the message acknowledged in the last packet names a frame
    /// that was sent and has not been overwritten.
    pub fn acked_frame_mut(&mut self) -> Option<&mut ClientFrame> {
        let ack = self.message_acknowledge;
        if ack <= 0 || ack >= self.netchan.outgoing_sequence {
            return None;
        }
        let frame = self.frame_mut(ack);
        (frame.message_num == ack).then_some(frame)
    }
}
