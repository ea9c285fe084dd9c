//! Protocol state of one connection, independent of the socket.
//!
//! `ClientSession` consumes decoded server messages (gamestate, reliable
//! server commands, snapshots, download blocks) and builds the outgoing
//! client messages that acknowledge them.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use jamp_shared::entity_state::UserCmd;
use jamp_shared::info::value_for_key;
use jamp_shared::limits::{CS_SYSTEMINFO, MAX_CONFIGSTRINGS};
use jamp_shared::net::{ClientMessage, DownloadBlock, Gamestate, ServerMessage};
use jamp_shared::parse::{atoi, tokenize_line};
use jamp_shared::reliable::{ChannelError, CommandWindow, ReliableCommands};
use jamp_shared::vm::{VmRegistry, VmSlot};

use crate::cgame;
use crate::download::{IncomingDownload, Progress};
use crate::snapshot::{ClientSnapshot, SnapshotRing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    /// Accepted, waiting for the gamestate.
    Connected,
    /// Gamestate received, waiting for the first snapshot.
    Primed,
    Active,
}

pub struct ClientSession {
    pub state: ConnState,
    pub client_num: usize,
    pub server_id: i32,
    pub checksum_feed: i32,
    pub configstrings: Vec<String>,
    /// `bcs0`/`bcs1` pieces collected so far.
    big_configstring: Option<(usize, String)>,
    pub snapshots: SnapshotRing,
    /// Latest valid snapshot.
    pub snap: Option<ClientSnapshot>,
    pub prev_snap: Option<ClientSnapshot>,
    /// Last server message sequence received.
    pub server_message_sequence: i32,
    /// Server commands executed.
    server_commands: CommandWindow,
    /// Client commands waiting for acknowledgement.
    pub reliable: ReliableCommands,
    /// Text of `print`/`chat` commands, oldest first.
    pub prints: Vec<String>,
    pub disconnect_reason: Option<String>,
    pub download: Option<IncomingDownload>,
    download_dir: PathBuf,
    /// Files written by completed downloads.
    pub downloaded: Vec<PathBuf>,
    vms: VmRegistry,
}

impl ClientSession {
    pub fn new(download_dir: PathBuf) -> Self {
        let mut vms = VmRegistry::new();
        vms.register_loader(VmSlot::CGame.module_name(), cgame::load);
        Self {
            state: ConnState::Connected,
            client_num: 0,
            server_id: 0,
            checksum_feed: 0,
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            big_configstring: None,
            snapshots: SnapshotRing::new(),
            snap: None,
            prev_snap: None,
            server_message_sequence: 0,
            server_commands: CommandWindow::default(),
            reliable: ReliableCommands::new(),
            prints: Vec::new(),
            disconnect_reason: None,
            download: None,
            download_dir,
            downloaded: Vec::new(),
            vms,
        }
    }

    pub fn configstring(&self, index: usize) -> &str {
        self.configstrings.get(index).map_or("", String::as_str)
    }

    /// Last server command executed.
    pub fn server_command_sequence(&self) -> i32 {
        self.server_commands.last()
    }

    /// Queues a reliable command for the server.
    pub fn add_command(&mut self, text: &str) -> Result<i32, ChannelError> {
        self.reliable.push(text)
    }

    /// `CL_ParseServerMessage`.
    pub fn handle_message(&mut self, sequence: i32, msg: ServerMessage) {
        self.server_message_sequence = sequence;
        if let Err(e) = self.reliable.acknowledge(msg.reliable_acknowledge) {
            debug!(error = %e, "server acknowledge ignored");
        }

        if let Some(gs) = msg.gamestate {
            self.parse_gamestate(sequence, gs);
        }
        for cmd in msg.commands {
            match self.server_commands.accept(cmd.sequence) {
                Ok(true) => self.execute_server_command(&cmd.text),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "server command stream broken");
                    self.disconnected(&e.to_string());
                }
            }
            if self.state == ConnState::Disconnected {
                return;
            }
        }
        if let Some(snap) = msg.snapshot {
            self.parse_snapshot(&snap);
        }
        if let Some(block) = msg.download {
            self.parse_download(&block);
        }
    }

    fn parse_gamestate(&mut self, sequence: i32, gs: Gamestate) {
        info!(client_num = gs.client_num, server_id = gs.server_id, "gamestate received");
        self.configstrings.iter_mut().for_each(String::clear);
        self.big_configstring = None;
        for (index, value) in gs.configstrings {
            match self.configstrings.get_mut(index) {
                Some(slot) => *slot = value,
                None => warn!(index, "configstring index out of range"),
            }
        }
        self.snapshots.reset(&gs.baselines);
        self.snap = None;
        self.prev_snap = None;
        self.client_num = gs.client_num;
        self.checksum_feed = gs.checksum_feed;
        self.server_id = gs.server_id;
        self.update_server_id();
        self.server_commands = CommandWindow::new(gs.command_sequence);
        self.state = ConnState::Primed;

        let handle = self.vms.handle(VmSlot::CGame);
        self.vms.free(handle);
        if self.vms.create(VmSlot::CGame).is_some() {
            let client_num = self.client_num;
            let _ = self
                .vms
                .with_cgame(|cg| cg.init(sequence, gs.command_sequence, client_num));
        }
    }

    /// `sv_serverid` from the systeminfo configstring.
    fn update_server_id(&mut self) {
        let id = value_for_key(self.configstring(CS_SYSTEMINFO), "sv_serverid");
        if !id.is_empty() {
            self.server_id = atoi(id);
        }
    }

    fn set_configstring(&mut self, index: usize, value: String) {
        let Some(slot) = self.configstrings.get_mut(index) else {
            warn!(index, "configstring index out of range");
            return;
        };
        *slot = value;
        if index == CS_SYSTEMINFO {
            self.update_server_id();
        }
    }

    fn disconnected(&mut self, reason: &str) {
        info!(reason, "disconnected by server");
        self.disconnect_reason = Some(reason.to_string());
        self.state = ConnState::Disconnected;
        let handle = self.vms.handle(VmSlot::CGame);
        if handle.is_some() {
            let _ = self.vms.with_cgame(|cg| cg.shutdown());
        }
        self.vms.free(handle);
    }

    /// `CL_CGameCommand` plus the commands the engine handles itself.
    fn execute_server_command(&mut self, text: &str) {
        let args = tokenize_line(text);
        let Some(cmd) = args.first() else {
            return;
        };
        let index = || args.get(1).map(|s| atoi(s).max(0) as usize).unwrap_or(0);
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

        match cmd.as_str() {
            "cs" => self.set_configstring(index(), arg(2)),
            "bcs0" => self.big_configstring = Some((index(), arg(2))),
            "bcs1" | "bcs2" => {
                let Some((i, mut value)) = self.big_configstring.take() else {
                    warn!(command = %cmd, "big configstring piece without a start");
                    return;
                };
                if i != index() {
                    warn!(expected = i, got = index(), "big configstring index changed");
                    return;
                }
                value.push_str(&arg(2));
                if cmd == "bcs2" {
                    self.set_configstring(i, value);
                } else {
                    self.big_configstring = Some((i, value));
                }
            }
            "print" | "chat" | "tchat" => {
                let text = arg(1);
                info!(target: "server", "{}", text.trim_end());
                self.prints.push(text);
            }
            "disconnect" => {
                let reason = arg(1);
                self.disconnected(if reason.is_empty() { "disconnected" } else { &reason });
            }
            "map_restart" => {
                info!("map_restart");
                self.snapshots.invalidate();
                self.snap = None;
                self.prev_snap = None;
            }
            _ => {
                let handled = self.vms.with_cgame(|cg| cg.console_command(&args)).unwrap_or(false);
                if !handled {
                    debug!(command = %text, "unknown server command");
                }
            }
        }
    }

    fn parse_snapshot(&mut self, msg: &jamp_shared::net::SnapshotMsg) {
        if self.state < ConnState::Primed {
            return;
        }
        match self.snapshots.decode(msg) {
            Ok(snap) => {
                let snap = snap.clone();
                let server_time = snap.server_time;
                self.prev_snap = self.snap.replace(snap);
                if self.state == ConnState::Primed {
                    info!(server_time, "first snapshot");
                    self.state = ConnState::Active;
                }
                let _ = self.vms.with_cgame(|cg| cg.draw_active_frame(server_time));
            }
            Err(e) => {
                debug!(message_num = msg.message_num, error = %e, "snapshot dropped");
            }
        }
    }

    /// Starts fetching `name` from the server.
    pub fn begin_download(&mut self, name: &str) -> Result<(), ChannelError> {
        info!(file = name, "requesting download");
        self.add_command(&format!("download {name}"))?;
        self.download = Some(IncomingDownload::new(name));
        Ok(())
    }

    fn parse_download(&mut self, block: &DownloadBlock) {
        let Some(download) = self.download.as_mut() else {
            debug!(block = block.block, "download block without a transfer");
            return;
        };
        let reply = match download.receive(block) {
            Progress::Ignored => return,
            Progress::Ack(n) => vec![format!("nextdl {n}")],
            Progress::Done(n) => {
                if let Some(d) = self.download.take() {
                    self.write_download(&d);
                }
                vec![format!("nextdl {n}"), "donedl".to_string()]
            }
            Progress::Refused(reason) => {
                warn!(%reason, "download refused");
                self.prints.push(reason);
                self.download = None;
                vec!["donedl".to_string()]
            }
        };
        for text in reply {
            if let Err(e) = self.add_command(&text) {
                warn!(error = %e, "download command not queued");
            }
        }
    }

    fn write_download(&mut self, d: &IncomingDownload) {
        let Some(path) = d.destination(&self.download_dir) else {
            warn!(file = %d.name, "refusing to write outside the download directory");
            return;
        };
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(&path, &d.data));
        match written {
            Ok(()) => {
                info!(file = %path.display(), size = d.data.len(), "download complete");
                self.downloaded.push(path);
            }
            Err(e) => warn!(file = %path.display(), error = %e, "could not write download"),
        }
    }

    /// Whether the next packet should ask for a full snapshot.
    pub fn wants_full_snapshot(&self) -> bool {
        match &self.snap {
            Some(snap) => snap.message_num != self.server_message_sequence,
            None => true,
        }
    }

    /// `CL_WritePacket`: acknowledgements, unacknowledged commands and
    /// `usercmds`.
    pub fn build_message(&self, usercmds: Vec<UserCmd>) -> ClientMessage {
        ClientMessage {
            server_id: self.server_id,
            message_acknowledge: self.server_message_sequence,
            reliable_acknowledge: self.server_commands.last(),
            commands: self.reliable.pending(),
            usercmds,
            no_delta: self.wants_full_snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jamp_shared::entity_state::PlayerStateDelta;
    use jamp_shared::limits::MAX_DOWNLOAD_BLKSIZE;
    use jamp_shared::net::{ReliableCommand, SnapshotMsg};

    fn cmd(sequence: i32, text: &str) -> ReliableCommand {
        ReliableCommand {
            sequence,
            text: text.to_string(),
        }
    }

    fn gamestate(command_sequence: i32) -> Gamestate {
        Gamestate {
            command_sequence,
            configstrings: vec![(CS_SYSTEMINFO, "\\sv_serverid\\77\\sv_cheats\\0".to_string()), (3, "Bespin".into())],
            baselines: Vec::new(),
            client_num: 2,
            checksum_feed: 9,
            server_id: 77,
        }
    }

    fn session() -> ClientSession {
        ClientSession::new(std::env::temp_dir())
    }

    fn snapshot(message_num: i32) -> SnapshotMsg {
        SnapshotMsg {
            server_time: 1000,
            message_num,
            delta_num: None,
            snap_flags: 0,
            player_state: PlayerStateDelta::default(),
            entities: Vec::new(),
        }
    }

    #[test]
    fn gamestate_then_snapshot_goes_active() {
        let mut s = session();
        s.handle_message(
            1,
            ServerMessage {
                gamestate: Some(gamestate(4)),
                commands: vec![cmd(4, "print \"stale\"")],
                ..Default::default()
            },
        );
        assert_eq!(s.state, ConnState::Primed);
        assert_eq!(s.client_num, 2);
        assert_eq!(s.server_id, 77);
        assert_eq!(s.configstring(3), "Bespin");
        assert!(s.prints.is_empty());

        s.handle_message(
            2,
            ServerMessage {
                snapshot: Some(snapshot(2)),
                commands: vec![cmd(5, "print \"hello\n\"")],
                ..Default::default()
            },
        );
        assert_eq!(s.state, ConnState::Active);
        assert_eq!(s.prints, vec!["hello\n"]);
        let out = s.build_message(Vec::new());
        assert_eq!(out.message_acknowledge, 2);
        assert_eq!(out.reliable_acknowledge, 5);
        assert!(!out.no_delta);
    }

    #[test]
    fn configstring_commands_and_server_id() {
        let mut s = session();
        s.handle_message(
            1,
            ServerMessage {
                gamestate: Some(gamestate(0)),
                ..Default::default()
            },
        );
        s.handle_message(
            2,
            ServerMessage {
                commands: vec![
                    cmd(1, "cs 1 \"\\sv_serverid\\90\""),
                    cmd(2, "bcs0 700 \"abc\""),
                    cmd(3, "bcs1 700 \"def\""),
                    cmd(4, "bcs2 700 \"gh\""),
                ],
                ..Default::default()
            },
        );
        assert_eq!(s.server_id, 90);
        assert_eq!(s.configstring(700), "abcdefgh");
    }

    #[test]
    fn disconnect_command_ends_the_session() {
        let mut s = session();
        s.handle_message(
            1,
            ServerMessage {
                commands: vec![cmd(1, "disconnect \"was kicked\""), cmd(2, "print \"late\"")],
                ..Default::default()
            },
        );
        assert_eq!(s.state, ConnState::Disconnected);
        assert_eq!(s.disconnect_reason.as_deref(), Some("was kicked"));
        assert!(s.prints.is_empty());
    }

    #[test]
    fn map_restart_forces_a_full_snapshot() {
        let mut s = session();
        s.handle_message(
            1,
            ServerMessage {
                gamestate: Some(gamestate(0)),
                snapshot: Some(snapshot(1)),
                ..Default::default()
            },
        );
        assert!(!s.wants_full_snapshot());
        s.handle_message(
            2,
            ServerMessage {
                commands: vec![cmd(1, "map_restart")],
                ..Default::default()
            },
        );
        assert!(s.wants_full_snapshot());
        assert!(s.snapshots.get(1).is_none());
    }

    #[test]
    fn download_blocks_are_acknowledged() {
        let dir = std::env::temp_dir().join(format!("jamp_cl_dl_{}", std::process::id()));
        let mut s = ClientSession::new(dir.clone());
        s.begin_download("sub/file.txt").unwrap();
        let block = |n: i32, len: usize| ServerMessage {
            download: Some(DownloadBlock {
                block: n,
                total_size: None,
                data: vec![b'x'; len],
                error: None,
            }),
            ..Default::default()
        };
        s.handle_message(1, block(0, MAX_DOWNLOAD_BLKSIZE));
        s.handle_message(2, block(1, 10));
        let texts: Vec<String> = s.reliable.pending().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["download sub/file.txt", "nextdl 0", "nextdl 1", "donedl"]);
        assert!(s.download.is_none());
        let written = std::fs::read(dir.join("sub/file.txt")).unwrap();
        assert_eq!(written.len(), MAX_DOWNLOAD_BLKSIZE + 10);
        std::fs::remove_dir_all(&dir).ok();
    }
}
