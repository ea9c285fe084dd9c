//! Server implementation.
//!
//! A frame-driven authoritative loop. Each `step`:
//! - runs queued operator commands
//! - drains the UDP socket (connectionless requests and client messages)
//! - advances the game module by one frame
//! - sends every client its due message (gamestate, snapshot, download
//!   block, reliable commands)
//!
//! Everything runs on one task. Module calls receive `ServerCore` as their
//! `GameImport`; drops they request are applied once the call returns.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use jamp_game::GameModuleLoader;
use jamp_shared::config::EngineConfig;
use jamp_shared::console::{Console, CvarFlags, CvarValue};
use jamp_shared::game_api::{GameExport, GameImport, GAME_API_VERSION};
use jamp_shared::info::{clean_name, pairs, set_value_for_key, value_for_key};
use jamp_shared::limits::{MAX_CLIENTS, PROTOCOL_VERSION};
use jamp_shared::net::{
    decode_datagram, decode_oob, decode_payload, ClientMessage, Datagram, Gamestate, Oob, PlayerStatus,
    ServerMessage, MAX_PACKETLEN,
};
use jamp_shared::parse::{atoi, tokenize_line};
use jamp_shared::vm::{VmRegistry, VmSlot};

use crate::access::{is_lan_address, Ban, BanList, Challenges, RateLimiter};
use crate::client::{Client, ClientState};
use crate::download::{Download, DownloadRefusal};
use crate::error::{DropReason, ServerError};
use crate::host::{entity_file, ServerCore, ServerState};
use crate::snapshot::{self, SNAPFLAG_RATE_DELAYED};

/// Frames run after spawning entities so movers and items settle before
/// baselines are taken.
const SETTLE_FRAMES: usize = 3;
const SETTLE_MSEC: i32 = 100;

/// Clients that have not entered the world hear from the server this often.
const LOADING_MESSAGE_MSEC: i32 = 1000;

/// Game server.
pub struct GameServer {
    pub cfg: EngineConfig,
    pub core: ServerCore,
    vms: VmRegistry,
    udp: UdpSocket,
    bans: BanList,
    challenges: Challenges,
    limiter: RateLimiter,
    rng: StdRng,
    download_dir: PathBuf,
    console_rx: Option<mpsc::Receiver<String>>,
    quit: bool,
}

impl GameServer {
    /// Binds the server socket and registers the game module.
    pub async fn new(cfg: EngineConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;

        let mut console = Console::new();
        Self::register_cvars(&mut console, &cfg);

        let mut vms = VmRegistry::new();
        vms.register_loader(VmSlot::Game.module_name(), GameModuleLoader);

        let max_clients = cfg.maxclients.clamp(1, MAX_CLIENTS);
        let core = ServerCore::new(console, PathBuf::from(&cfg.maps_dir), max_clients);

        Ok(Self {
            download_dir: PathBuf::from(&cfg.download_dir),
            cfg,
            core,
            vms,
            udp,
            bans: BanList::default(),
            challenges: Challenges::default(),
            limiter: RateLimiter::new(10, 1000),
            rng: StdRng::from_entropy(),
            console_rx: None,
            quit: false,
        })
    }

    fn register_cvars(console: &mut Console, cfg: &EngineConfig) {
        let c = console;
        c.register_cvar(
            "sv_hostname",
            CvarValue::String("noname".into()),
            CvarFlags::SERVERINFO | CvarFlags::ARCHIVE,
            "Server name shown in browsers",
        );
        c.register_cvar(
            "sv_maxclients",
            CvarValue::Int(cfg.maxclients as i64),
            CvarFlags::SERVERINFO | CvarFlags::LATCH,
            "Max connected clients",
        );
        c.register_cvar("sv_fps", CvarValue::Int(i64::from(cfg.sv_fps)), CvarFlags::NONE, "Server frames per second");
        c.register_cvar(
            "sv_timeout",
            CvarValue::Int(i64::from(cfg.timeout_secs)),
            CvarFlags::NONE,
            "Seconds without traffic before a client is dropped",
        );
        c.register_cvar(
            "sv_zombietime",
            CvarValue::Int(i64::from(cfg.zombie_secs)),
            CvarFlags::NONE,
            "Seconds a dropped slot stays reserved",
        );
        c.register_cvar(
            "sv_lanForceRate",
            CvarValue::Int(1),
            CvarFlags::ARCHIVE,
            "Send LAN clients a snapshot every frame",
        );
        c.register_cvar(
            "sv_reconnectlimit",
            CvarValue::Int(3),
            CvarFlags::NONE,
            "Seconds before the same client may connect again",
        );
        c.register_cvar("sv_allowDownload", CvarValue::Int(1), CvarFlags::SERVERINFO, "Allow client downloads");
        c.register_cvar(
            "sv_maxRate",
            CvarValue::Int(0),
            CvarFlags::SERVERINFO | CvarFlags::ARCHIVE,
            "Cap on client rate, 0 for none",
        );
        c.register_cvar(
            "sv_cheats",
            CvarValue::Int(0),
            CvarFlags::SYSTEMINFO | CvarFlags::ROM,
            "Allow cheat commands",
        );
        c.register_cvar("sv_serverid", CvarValue::Int(0), CvarFlags::SYSTEMINFO | CvarFlags::ROM, "");
        c.register_cvar("mapname", CvarValue::String("nomap".into()), CvarFlags::SERVERINFO | CvarFlags::ROM, "");
        c.register_cvar(
            "protocol",
            CvarValue::Int(i64::from(PROTOCOL_VERSION)),
            CvarFlags::SERVERINFO | CvarFlags::ROM,
            "",
        );
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    pub fn state(&self) -> ServerState {
        self.core.state
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn vms(&self) -> &VmRegistry {
        &self.vms
    }

    /// Runs the server for a number of frames in real time.
    pub async fn run_for_frames(&mut self, frames: u32) -> anyhow::Result<()> {
        let dt = Duration::from_millis(u64::from(1000 / self.cfg.sv_fps.max(1)));
        let mut next = Instant::now();
        for _ in 0..frames {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one server frame.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands();
        self.recv_packets()?;
        self.frame();
        self.flush_outbox().await;
        Ok(())
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = match self.console_rx.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => Vec::new(),
        };
        for line in lines {
            match self.exec_console(&line) {
                Ok(output) => output.iter().for_each(|l| info!(target: "console", "{l}")),
                Err(e) => warn!(target: "console", "{e:#}"),
            }
        }
    }

    fn recv_packets(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_PACKETLEN];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => self.handle_packet(from, &buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    async fn flush_outbox(&mut self) {
        for (to, datagram) in std::mem::take(&mut self.core.outbox) {
            if let Err(e) = self.udp.send_to(&datagram, to).await {
                debug!(%to, error = %e, "send failed");
            }
        }
    }

    /// Datagrams produced since the last flush.
    pub fn take_outbox(&mut self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut self.core.outbox)
    }

    /// `SV_Frame` minus socket I/O.
    pub fn frame(&mut self) {
        if self.core.state != ServerState::Game {
            return;
        }
        self.core.time += 1000 / self.core.sv_fps();
        self.check_timeouts();

        if let Err(e) = self.run_game_frame() {
            error!(error = %e, "game frame failed");
            self.shutdown(&format!("Server crashed: {e}"));
            return;
        }
        self.core.update_info_configstrings(false);
        self.send_client_messages();
    }

    fn run_game_frame(&mut self) -> Result<(), ServerError> {
        let time = self.core.time;
        self.vms.with_game(|g| g.run_frame(&mut self.core, time))??;
        self.flush_drops();
        Ok(())
    }

    fn check_timeouts(&mut self) {
        let time = self.core.time;
        let cvars = self.core.console.cvars();
        let timeout = cvars.int("sv_timeout") as i32 * 1000;
        let zombie = cvars.int("sv_zombietime") as i32 * 1000;

        let mut timed_out = Vec::new();
        for idx in 0..self.core.clients.len() {
            let Some(c) = self.core.client(idx) else {
                continue;
            };
            if c.state == ClientState::Zombie {
                if time - c.zombie_since > zombie {
                    debug!(client = idx, "Going from ZOMBIE to FREE");
                    self.core.clients[idx] = None;
                }
            } else if time - c.last_packet_time > timeout {
                timed_out.push(idx);
            }
        }
        for idx in timed_out {
            self.drop_client(idx, DropReason::TimedOut);
        }
    }

    fn next_server_id(&self) -> i32 {
        self.core.time.max(self.core.server_id + 1)
    }

    fn set_rom(&mut self, name: &str, value: &str) {
        if let Err(e) = self.core.console.cvars_mut().force_set(name, value) {
            warn!(cvar = name, error = %e, "could not set");
        }
    }

    /// `SV_SpawnServer`: loads `map` and spawns its entities. On failure the
    /// server is left DEAD.
    pub fn spawn_server(&mut self, map: &str) -> Result<(), ServerError> {
        let path = entity_file(self.core.maps_dir(), map)?;
        if !path.is_file() {
            return Err(ServerError::MapNotFound(map.to_string()));
        }

        info!(map, "------ Server Initialization ------");
        self.shutdown_game(false);
        self.core.state = ServerState::Loading;
        self.core.clear_level();
        self.core.console.cvars_mut().apply_latched();

        let result = self.load_level(map);
        if let Err(e) = &result {
            error!(map, error = %e, "map load failed");
            self.shutdown(&e.to_string());
        }
        result
    }

    fn load_level(&mut self, map: &str) -> Result<(), ServerError> {
        self.core.load_entities(map)?;
        self.core.server_id = self.next_server_id();
        self.core.restarted_server_id = self.core.server_id;
        self.core.checksum_feed = self.rng.gen::<i32>() & 0x7fff_ffff;
        self.set_rom("sv_serverid", &self.core.server_id.to_string());
        self.set_rom("mapname", map);
        self.set_rom("g_restarted", "0");

        for c in self.core.clients.iter_mut().flatten() {
            if c.state >= ClientState::Connected {
                c.reset_for_new_level();
            }
        }

        self.vms.create(VmSlot::Game).ok_or(ServerError::NoGame)?;
        let got = self.vms.game().map_or(0, |g| g.api_version());
        if got != GAME_API_VERSION {
            return Err(ServerError::GameVersion {
                got,
                expected: GAME_API_VERSION,
            });
        }
        let (time, seed) = (self.core.time, self.rng.gen::<i32>());
        self.vms.with_game(|g| g.init_game(&mut self.core, time, seed, false))??;

        self.settle()?;
        self.create_baselines();
        self.reconnect_clients(false);
        self.run_game_frame()?;
        self.core.time += SETTLE_MSEC;

        self.core.update_info_configstrings(true);
        self.core.state = ServerState::Game;
        self.core.map_name = map.to_string();
        info!(map, server_id = self.core.server_id, "-----------------------------------");
        Ok(())
    }

    fn settle(&mut self) -> Result<(), ServerError> {
        for _ in 0..SETTLE_FRAMES {
            self.run_game_frame()?;
            self.core.time += SETTLE_MSEC;
        }
        Ok(())
    }

    /// `SV_CreateBaseline`: every linked entity's state becomes its delta
    /// base for clients that have not seen it.
    fn create_baselines(&mut self) {
        let Some(game) = self.vms.game() else {
            return;
        };
        for num in 0..game.num_entities() {
            if let Some(ent) = game.shared_entity(num).filter(|e| e.r.linked) {
                self.core.world.set_baseline(num, ent.s.clone());
            }
        }
    }

    /// Hands connected clients to a fresh game instance.
    fn reconnect_clients(&mut self, restart: bool) {
        for idx in 0..self.core.clients.len() {
            let state = self.core.client_state(idx);
            if state < ClientState::Connected {
                continue;
            }
            let denied = self
                .vms
                .with_game(|g| g.client_connect(&mut self.core, idx, false, false))
                .unwrap_or_else(|e| Some(e.to_string()));
            if let Some(reason) = denied {
                self.drop_client(idx, DropReason::Game(reason));
                continue;
            }
            if restart && state == ClientState::Active {
                let _ = self.vms.with_game(|g| g.client_begin(&mut self.core, idx));
            }
        }
        self.flush_drops();
    }

    /// `SV_MapRestart_f`: reloads the game module in place. Connected
    /// clients stay connected and keep their sessions.
    pub fn map_restart(&mut self) -> Result<(), ServerError> {
        if self.core.state != ServerState::Game {
            return Err(ServerError::NotRunning);
        }
        let handle = self.vms.handle(VmSlot::Game).ok_or(ServerError::NoGame)?;
        info!(map = %self.core.map_name, "map_restart");

        self.core.restarted_server_id = self.core.server_id;
        self.core.server_id = self.next_server_id();
        self.set_rom("sv_serverid", &self.core.server_id.to_string());
        self.set_rom("g_restarted", "1");
        self.core.restarting = true;

        let time = self.core.time;
        for c in self.core.clients.iter_mut().flatten() {
            c.next_snapshot_time = time;
        }
        self.core.send_server_command(None, "map_restart");
        self.core.update_info_configstrings(false);

        let _ = self.vms.with_game(|g| g.shutdown_game(&mut self.core, true));
        let result = self.restart_game(handle);
        self.core.restarting = false;
        if let Err(e) = &result {
            error!(error = %e, "map_restart failed");
            self.shutdown(&e.to_string());
        }
        result
    }

    fn restart_game(&mut self, handle: jamp_shared::vm::VmHandle) -> Result<(), ServerError> {
        let handle = self.vms.restart(handle).ok_or(ServerError::NoGame)?;
        if let Some(vm) = self.vms.get(handle) {
            debug!(vm = vm.name, "module restarted");
        }
        self.core.rewind_entities();
        let (time, seed) = (self.core.time, self.rng.gen::<i32>());
        self.vms.with_game(|g| g.init_game(&mut self.core, time, seed, true))??;
        self.settle()?;
        self.reconnect_clients(true);
        Ok(())
    }

    /// Shuts the game module down, if one is loaded.
    fn shutdown_game(&mut self, restart: bool) {
        if let Some(handle) = self.vms.handle(VmSlot::Game) {
            let _ = self.vms.with_game(|g| g.shutdown_game(&mut self.core, restart));
            self.vms.free(Some(handle));
        }
    }

    /// `SV_Shutdown`: tells every client why, then unloads the level.
    pub fn shutdown(&mut self, reason: &str) {
        if self.core.state == ServerState::Dead && self.vms.game().is_none() {
            return;
        }
        info!(reason, "----- Server Shutdown -----");
        for idx in 0..self.core.clients.len() {
            if self.core.client_state(idx) >= ClientState::Connected {
                self.core.add_server_command(idx, &format!("print \"{reason}\n\""));
                self.core.add_server_command(idx, &format!("disconnect \"{reason}\""));
                self.core.transmit(idx, ServerMessage::default());
            }
        }
        self.shutdown_game(false);
        self.core.clients.iter_mut().for_each(|c| *c = None);
        self.core.pending_drops.clear();
        self.core.clear_level();
        self.core.map_name.clear();
        self.core.state = ServerState::Dead;
    }

    fn flush_drops(&mut self) {
        while !self.core.pending_drops.is_empty() {
            for (idx, reason) in std::mem::take(&mut self.core.pending_drops) {
                self.drop_client(idx, reason);
            }
        }
    }

    /// `SV_DropClient`: the game forgets the client, the client is told why
    /// and the slot goes ZOMBIE.
    pub fn drop_client(&mut self, idx: usize, reason: DropReason) {
        let time = self.core.time;
        let name = match self.core.client(idx) {
            Some(c) if c.state != ClientState::Zombie => c.name.clone(),
            _ => return,
        };
        info!(client = idx, %name, %reason, "dropping client");

        if let Some(c) = self.core.client_mut(idx) {
            c.state = ClientState::Zombie;
            c.zombie_since = time;
            c.download = None;
        }
        let _ = self.vms.with_game(|g| g.client_disconnect(&mut self.core, idx));
        self.core.add_server_command(idx, &format!("disconnect \"{reason}\""));
        self.core.transmit(idx, ServerMessage::default());
    }

    /// Entry point for one received datagram.
    pub fn handle_packet(&mut self, from: SocketAddr, data: &[u8]) {
        let datagram = match decode_datagram(data, true) {
            Ok(d) => d,
            Err(e) => {
                debug!(%from, error = %e, "bad packet");
                return;
            }
        };
        match datagram {
            Datagram::Connectionless(body) => match decode_oob(&body) {
                Ok(msg) => self.connectionless(from, msg),
                Err(e) => debug!(%from, error = %e, "bad connectionless packet"),
            },
            Datagram::Sequenced {
                sequence,
                qport,
                fragment,
                body,
            } => self.sequenced(from, sequence, qport.unwrap_or(0), fragment, body),
        }
    }

    fn connectionless(&mut self, from: SocketAddr, msg: Oob) {
        let now = self.core.milliseconds();
        match msg {
            Oob::GetChallenge { client_challenge } => {
                if self.limiter.limit_address(from.ip(), now) {
                    debug!(%from, "getchallenge rate limited");
                    return;
                }
                let challenge = self.challenges.issue(from, client_challenge, now, &mut self.rng);
                self.core.push_oob(
                    from,
                    &Oob::ChallengeResponse {
                        challenge,
                        client_challenge,
                    },
                );
            }
            Oob::Connect { userinfo } => {
                if self.limiter.limit_address(from.ip(), now) {
                    debug!(%from, "connect rate limited");
                    return;
                }
                self.direct_connect(from, &userinfo);
            }
            Oob::GetStatus { challenge } => {
                if self.limiter.limit_outbound(now, 10, 100) {
                    debug!(%from, "status reply rate limited");
                    return;
                }
                self.status_response(from, &challenge);
            }
            other => debug!(%from, ?other, "unexpected connectionless message"),
        }
    }

    fn reject(&mut self, to: SocketAddr, text: &str) {
        debug!(%to, text, "connection rejected");
        self.core.push_oob(
            to,
            &Oob::Print {
                text: format!("{text}\n"),
            },
        );
    }

    /// `SV_DirectConnect`.
    fn direct_connect(&mut self, from: SocketAddr, userinfo: &str) {
        if atoi(value_for_key(userinfo, "protocol")) != PROTOCOL_VERSION {
            self.reject(from, &format!("Server uses protocol version {PROTOCOL_VERSION}."));
            return;
        }
        if self.bans.is_banned(from.ip()) {
            self.reject(from, "You are banned from this server.");
            return;
        }
        let challenge = atoi(value_for_key(userinfo, "challenge"));
        if !self.challenges.verify(from, challenge) {
            self.reject(from, "No or bad challenge for your address.");
            return;
        }
        if self.core.state != ServerState::Game {
            self.reject(from, "Server is not running.");
            return;
        }
        let qport = atoi(value_for_key(userinfo, "qport")) as u16;

        let existing = self.core.clients.iter().position(|c| {
            c.as_ref()
                .is_some_and(|c| c.addr().ip() == from.ip() && c.netchan.qport == qport)
        });
        let limit_ms = self.core.console.cvars().int("sv_reconnectlimit") as i32 * 1000;
        let last_connect = existing.and_then(|idx| self.core.client(idx)).map(|c| c.last_connect_time);
        if last_connect.is_some_and(|t| self.core.time - t < limit_ms) {
            self.reject(from, "Reconnect rejected, too soon.");
            return;
        }
        let slot = match existing {
            Some(idx) => {
                info!(client = idx, %from, "reconnect");
                if self.core.client_state(idx) >= ClientState::Connected {
                    let _ = self.vms.with_game(|g| g.client_disconnect(&mut self.core, idx));
                }
                Some(idx)
            }
            None => self.core.clients.iter().position(Option::is_none),
        };
        let Some(idx) = slot else {
            self.reject(from, "Server is full.");
            return;
        };

        let mut client = Client::new(from, qport, challenge, userinfo.to_string(), self.core.time);
        client.apply_userinfo(self.core.max_rate(), self.core.sv_fps());
        let name = client.name.clone();
        self.core.clients[idx] = Some(client);

        let denied = self
            .vms
            .with_game(|g| g.client_connect(&mut self.core, idx, true, false))
            .unwrap_or_else(|e| Some(e.to_string()));
        if let Some(reason) = denied {
            info!(client = idx, %from, %reason, "game rejected connection");
            self.core.clients[idx] = None;
            self.reject(from, &reason);
            return;
        }

        info!(client = idx, %name, %from, "client connected");
        self.core.push_oob(from, &Oob::ConnectResponse { challenge });
        self.flush_drops();
    }

    fn status_response(&mut self, to: SocketAddr, challenge: &str) {
        let serverinfo = self.core.get_serverinfo();
        let info = set_value_for_key(&serverinfo, "challenge", challenge).unwrap_or(serverinfo);
        let game = self.vms.game();
        let players = self
            .core
            .clients
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| c.as_ref().filter(|c| c.state >= ClientState::Connected).map(|c| (idx, c)))
            .map(|(idx, c)| PlayerStatus {
                score: game.and_then(|g| g.player_state(idx)).map_or(0, |ps| ps.persistant[0]),
                ping: c.ping,
                name: c.name.clone(),
            })
            .collect();
        self.core.push_oob(to, &Oob::StatusResponse { info, players });
    }

    fn sequenced(&mut self, from: SocketAddr, sequence: i32, qport: u16, fragment: Option<(u32, u32)>, body: Bytes) {
        let found = self.core.clients.iter().position(|c| {
            c.as_ref()
                .is_some_and(|c| c.addr().ip() == from.ip() && c.netchan.qport == qport)
        });
        let Some(idx) = found else {
            debug!(%from, qport, "sequenced packet from unknown address");
            return;
        };
        let time = self.core.time;
        let Some(client) = self.core.client_mut(idx) else {
            return;
        };
        if client.addr().port() != from.port() {
            info!(client = idx, %from, "fixing up a translated port");
            client.netchan.remote = from;
        }
        let Some(payload) = client.netchan.process(sequence, fragment, body) else {
            return;
        };
        // Zombies only keep the channel in step.
        if client.state == ClientState::Zombie {
            return;
        }
        client.last_packet_time = time;

        match decode_payload::<ClientMessage>(&payload) {
            Ok(msg) => self.execute_client_message(idx, msg),
            Err(e) => {
                debug!(client = idx, error = %e, "undecodable client message");
                self.drop_client(idx, DropReason::Illegible);
            }
        }
    }

    /// `SV_ExecuteClientMessage`.
    fn execute_client_message(&mut self, idx: usize, msg: ClientMessage) {
        let time = self.core.time;
        let (server_id, restarted_id) = (self.core.server_id, self.core.restarted_server_id);
        let Some(client) = self.core.client_mut(idx) else {
            return;
        };
        if msg.message_acknowledge < 0 {
            self.drop_client(idx, DropReason::Illegible);
            return;
        }

        let ack = msg.message_acknowledge;
        let regressed = ack < client.message_acknowledge;
        client.message_acknowledge = ack;
        let sent_at = client
            .acked_frame_mut()
            .filter(|f| f.acked_at.is_none())
            .map(|f| {
                f.acked_at = Some(time);
                f.sent_at
            });
        if let Some(sent_at) = sent_at {
            client.ping = time - sent_at;
        }

        if let Err(e) = client.reliable.acknowledge(msg.reliable_acknowledge) {
            self.drop_client(idx, DropReason::Channel(e));
            return;
        }

        let downloading = client.download.is_some() || client.last_command_text.starts_with("nextdl");
        if msg.server_id != server_id && !downloading {
            if msg.server_id >= restarted_id && msg.server_id < server_id {
                // Has not seen the map_restart yet.
                return;
            }
            if client.message_acknowledge > client.gamestate_message_num {
                self.send_gamestate(idx);
            }
            return;
        }

        for cmd in &msg.commands {
            let accepted = match self.core.client_mut(idx) {
                Some(c) => c.commands.accept(cmd.sequence),
                None => return,
            };
            match accepted {
                Ok(false) => continue,
                Ok(true) => {
                    self.execute_client_command(idx, &cmd.text);
                    if self.core.client_state(idx) <= ClientState::Zombie {
                        return;
                    }
                }
                Err(e) => {
                    warn!(client = idx, error = %e, "lost reliable commands");
                    self.drop_client(idx, DropReason::Channel(e));
                    return;
                }
            }
        }

        if !msg.usercmds.is_empty() {
            self.user_move(idx, &msg, regressed);
        }
    }

    /// `SV_UserMove`.
    fn user_move(&mut self, idx: usize, msg: &ClientMessage, regressed: bool) {
        let Some(client) = self.core.client_mut(idx) else {
            return;
        };
        client.delta_message = if msg.no_delta || regressed {
            None
        } else {
            Some(client.message_acknowledge)
        };
        if client.state == ClientState::Primed {
            self.client_enter_world(idx);
        }
        if self.core.client_state(idx) != ClientState::Active {
            if let Some(c) = self.core.client_mut(idx) {
                c.delta_message = None;
            }
            return;
        }

        for cmd in &msg.usercmds {
            let Some(client) = self.core.client_mut(idx) else {
                return;
            };
            if cmd.server_time <= client.last_usercmd.server_time {
                continue;
            }
            client.last_usercmd = *cmd;
            let _ = self.vms.with_game(|g| g.client_think(&mut self.core, idx, cmd));
        }
        self.flush_drops();
    }

    fn client_enter_world(&mut self, idx: usize) {
        let time = self.core.time;
        let Some(client) = self.core.client_mut(idx) else {
            return;
        };
        debug!(client = idx, name = %client.name, "going from PRIMED to ACTIVE");
        client.state = ClientState::Active;
        client.delta_message = None;
        client.next_snapshot_time = time;
        let _ = self.vms.with_game(|g| g.client_begin(&mut self.core, idx));
        self.flush_drops();
    }

    /// `SV_SendClientGameState`.
    fn send_gamestate(&mut self, idx: usize) {
        let configstrings: Vec<(usize, String)> = self
            .core
            .configstrings
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, s)| (i, s.clone()))
            .collect();
        let baselines = self.core.world.baselines().cloned().collect();
        let (checksum_feed, server_id) = (self.core.checksum_feed, self.core.server_id);

        let Some(client) = self.core.client_mut(idx) else {
            return;
        };
        debug!(client = idx, name = %client.name, "sending gamestate");
        let gamestate = Gamestate {
            command_sequence: client.reliable.sequence(),
            configstrings,
            baselines,
            client_num: idx,
            checksum_feed,
            server_id,
        };
        client.state = ClientState::Primed;
        client.delta_message = None;
        client.gamestate_message_num = client.netchan.outgoing_sequence;
        let pending = std::mem::take(&mut client.pending_configstrings);

        self.core.transmit(
            idx,
            ServerMessage {
                gamestate: Some(gamestate),
                ..Default::default()
            },
        );
        for index in pending {
            self.core.send_configstring(idx, index);
        }
    }

    /// `SV_ExecuteClientCommand`: engine commands first, the rest to the
    /// game once the client is in the world.
    fn execute_client_command(&mut self, idx: usize, text: &str) {
        let args = tokenize_line(text);
        let Some(name) = args.first().map(|s| s.to_ascii_lowercase()) else {
            return;
        };
        let (max_rate, fps) = (self.core.max_rate(), self.core.sv_fps());
        let Some(client) = self.core.client_mut(idx) else {
            return;
        };
        client.last_command_text = text.to_string();
        let arg1 = args.get(1).cloned().unwrap_or_default();

        match name.as_str() {
            "userinfo" => {
                client.userinfo = arg1;
                client.apply_userinfo(max_rate, fps);
                let _ = self.vms.with_game(|g| g.client_userinfo_changed(&mut self.core, idx));
                self.flush_drops();
            }
            "disconnect" => self.drop_client(idx, DropReason::Disconnected),
            "download" => self.begin_download(idx, &arg1),
            "nextdl" => {
                if let Some(d) = client.download.as_mut() {
                    if d.acknowledge(atoi(&arg1)) {
                        info!(client = idx, file = %d.name, "download complete");
                        client.download = None;
                    }
                }
            }
            "stopdl" => {
                if let Some(d) = client.download.take() {
                    debug!(client = idx, file = %d.name, "download stopped");
                }
            }
            "donedl" => {
                client.download = None;
                if client.state != ClientState::Active {
                    self.send_gamestate(idx);
                }
            }
            _ => {
                if client.state != ClientState::Active {
                    debug!(client = idx, command = %name, "command before entering the world ignored");
                    return;
                }
                self.core.args = args;
                let _ = self.vms.with_game(|g| g.client_command(&mut self.core, idx));
                self.flush_drops();
            }
        }
    }

    fn begin_download(&mut self, idx: usize, name: &str) {
        let allowed = self.core.console.cvars().int("sv_allowDownload") != 0;
        let opened = if allowed {
            Download::open(&self.download_dir, name)
        } else {
            Err(DownloadRefusal::Disabled(name.to_string()))
        };
        match opened {
            Ok(d) => {
                info!(client = idx, file = name, size = d.size(), "beginning download");
                let time = self.core.time;
                if let Some(c) = self.core.client_mut(idx) {
                    c.download = Some(d);
                    c.next_snapshot_time = time;
                }
            }
            Err(refusal) => {
                warn!(client = idx, file = name, %refusal, "download refused");
                if let Some(c) = self.core.client_mut(idx) {
                    c.download = None;
                }
                self.core.transmit(
                    idx,
                    ServerMessage {
                        download: Some(refusal.block()),
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// `SV_SendClientMessages`.
    fn send_client_messages(&mut self) {
        let Some(game) = self.vms.game() else {
            return;
        };
        let core = &mut self.core;
        let time = core.time;
        let lan_force_rate = core.lan_force_rate();

        for idx in 0..core.clients.len() {
            let Some(client) = core.clients[idx].as_mut() else {
                continue;
            };
            if client.state <= ClientState::Zombie || time < client.next_snapshot_time {
                continue;
            }
            let download = client.download.as_mut().and_then(|d| d.next_block(time));
            let downloading = client.download.is_some();

            if client.state != ClientState::Active {
                if download.is_none() && client.reliable.outstanding() == 0 {
                    continue;
                }
                client.next_snapshot_time = time
                    + if downloading {
                        client.snapshot_msec
                    } else {
                        LOADING_MESSAGE_MSEC
                    };
                core.transmit(
                    idx,
                    ServerMessage {
                        download,
                        ..Default::default()
                    },
                );
                continue;
            }

            let message_num = client.netchan.outgoing_sequence;
            let mut frame = snapshot::build_frame(game, &core.world, idx, core.cull_distance, time);
            frame.message_num = message_num;
            frame.sent_at = time;
            let flags = if client.rate_delayed { SNAPFLAG_RATE_DELAYED } else { 0 };
            let snap = snapshot::encode(&frame, snapshot::delta_reference(client), &core.world, flags);
            *client.frame_mut(message_num) = frame;

            let sent = core.transmit(
                idx,
                ServerMessage {
                    snapshot: Some(snap),
                    download,
                    ..Default::default()
                },
            );
            let (Some((_, size)), Some(client)) = (sent, core.clients[idx].as_mut()) else {
                continue;
            };
            client.frame_mut(message_num).size = size;
            let ip = client.addr().ip();
            if ip.is_loopback() || (lan_force_rate && is_lan_address(ip)) {
                client.rate_delayed = false;
                client.next_snapshot_time = time + client.snapshot_msec;
                continue;
            }
            let rate_ms = snapshot::rate_msec(client.rate, size);
            client.rate_delayed = rate_ms > client.snapshot_msec;
            client.next_snapshot_time = time + rate_ms.max(client.snapshot_msec);
        }
    }

    /// `SV_GetPlayerByHandle`: a slot number or a player name.
    fn find_client(&self, handle: &str) -> Option<usize> {
        if !handle.is_empty() && handle.bytes().all(|b| b.is_ascii_digit()) {
            let idx: usize = handle.parse().ok()?;
            return (self.core.client_state(idx) >= ClientState::Connected).then_some(idx);
        }
        let wanted = clean_name(handle);
        (0..self.core.clients.len()).find(|&i| {
            self.core
                .client(i)
                .is_some_and(|c| c.state >= ClientState::Connected && c.name.eq_ignore_ascii_case(&wanted))
        })
    }

    fn status_lines(&self) -> Vec<String> {
        let mut out = vec![
            format!("map: {}", if self.core.map_name.is_empty() { "none" } else { &self.core.map_name }),
            "num score ping name            address".to_string(),
            "--- ----- ---- --------------- ---------------------".to_string(),
        ];
        let game = self.vms.game();
        for (idx, c) in self.core.clients.iter().enumerate() {
            let Some(c) = c else {
                continue;
            };
            let score = game.and_then(|g| g.player_state(idx)).map_or(0, |ps| ps.persistant[0]);
            let ping = match c.state {
                ClientState::Zombie => "ZMBI".to_string(),
                ClientState::Connected | ClientState::Primed => "CNCT".to_string(),
                _ => c.ping.min(999).to_string(),
            };
            out.push(format!("{idx:3} {score:5} {ping:>4} {:<15} {}", c.name, c.addr()));
        }
        out
    }

    fn ban_command(&mut self, arg: Option<&str>, exception: bool) -> Vec<String> {
        let kind = if exception { "exception" } else { "ban" };
        let Some(arg) = arg else {
            return vec![format!("Usage: {}ban <ip[/subnet]>", if exception { "except" } else { "" })];
        };
        let ban = match Ban::parse(arg, exception) {
            Ok(b) => b,
            Err(e) => return vec![format!("Error: {e}")],
        };
        match self.bans.add(ban) {
            Ok(()) => vec![format!("Added {kind}: {ban}")],
            Err(e) => vec![format!("Error: {e}")],
        }
    }

    /// Executes an operator command line.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens = tokenize_line(line.trim());
        let Some(cmd) = tokens.first().map(|t| t.to_ascii_lowercase()) else {
            return Ok(Vec::new());
        };
        let arg = |i: usize| tokens.get(i).map(String::as_str);
        let running = self.core.state == ServerState::Game;

        match cmd.as_str() {
            "map" | "devmap" => {
                let Some(name) = arg(1) else {
                    return Ok(vec!["Usage: map <mapname>".to_string()]);
                };
                let name = name.to_string();
                self.set_rom("sv_cheats", if cmd == "devmap" { "1" } else { "0" });
                match self.spawn_server(&name) {
                    Ok(()) => Ok(vec![format!("Map '{name}' loaded")]),
                    Err(e) => Ok(vec![format!("Failed to load map: {e}")]),
                }
            }
            "map_restart" => match self.map_restart() {
                Ok(()) => Ok(Vec::new()),
                Err(e) => Ok(vec![e.to_string()]),
            },
            "status" => {
                if !running {
                    return Ok(vec![ServerError::NotRunning.to_string()]);
                }
                Ok(self.status_lines())
            }
            "kick" | "clientkick" => {
                if !running {
                    return Ok(vec![ServerError::NotRunning.to_string()]);
                }
                let Some(handle) = arg(1) else {
                    return Ok(vec![format!("Usage: {cmd} <player>")]);
                };
                let found = if cmd == "clientkick" {
                    handle
                        .parse::<usize>()
                        .ok()
                        .filter(|&i| self.core.client_state(i) >= ClientState::Connected)
                } else {
                    self.find_client(handle)
                };
                match found {
                    Some(idx) => {
                        self.drop_client(idx, DropReason::Kicked);
                        Ok(Vec::new())
                    }
                    None => Ok(vec![format!("Player {handle} is not on the server")]),
                }
            }
            "ban" => Ok(self.ban_command(arg(1), false)),
            "exceptban" => Ok(self.ban_command(arg(1), true)),
            "unban" => {
                let Some(a) = arg(1) else {
                    return Ok(vec!["Usage: unban <ip[/subnet]>".to_string()]);
                };
                let mut removed = 0;
                for exception in [false, true] {
                    if let Ok(ban) = Ban::parse(a, exception) {
                        removed += self.bans.remove(&ban);
                    }
                }
                Ok(vec![format!("Removed {removed} entries")])
            }
            "listbans" => Ok(self
                .bans
                .iter()
                .enumerate()
                .map(|(i, b)| format!("{} {i}: {b}", if b.exception { "Except" } else { "Ban" }))
                .collect()),
            "serverinfo" => {
                let info = self.core.get_serverinfo();
                Ok(pairs(&info).map(|(k, v)| format!("{k:<20} {v}")).collect())
            }
            "svsay" => {
                if !running {
                    return Ok(vec![ServerError::NotRunning.to_string()]);
                }
                let text = tokens[1..].join(" ");
                self.core.send_server_command(None, &format!("chat \"server: {text}\""));
                self.flush_drops();
                Ok(Vec::new())
            }
            "quit" => {
                self.shutdown("Server quit");
                self.quit = true;
                Ok(vec!["Server shutting down".to_string()])
            }
            _ => {
                if self.vms.game().is_some() {
                    self.core.args = tokens.clone();
                    let handled = self
                        .vms
                        .with_game(|g| g.console_command(&mut self.core))
                        .unwrap_or(false);
                    self.flush_drops();
                    if handled {
                        return Ok(Vec::new());
                    }
                }
                self.core.console.exec(line)
            }
        }
    }
}

/// Helper for tests: a server on an ephemeral localhost port.
pub async fn bind_ephemeral(maps_dir: PathBuf, download_dir: PathBuf) -> anyhow::Result<GameServer> {
    let cfg = EngineConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        maps_dir: maps_dir.display().to_string(),
        download_dir: download_dir.display().to_string(),
        ..Default::default()
    };
    let mut server = GameServer::new(cfg).await?;
    server.cfg.server_addr = server.local_addr()?.to_string();
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jamp_shared::entity_state::UserCmd;
    use jamp_shared::net::{encode_oob, encode_payload, Netchan, ReliableCommand};

    const MAP: &str = r#"
{ "classname" "worldspawn" "message" "Test Arena" "distanceCull" "4000" }
{ "classname" "info_player_deathmatch" "origin" "64 0 24" }
{ "classname" "info_null" "origin" "0 0 0" }
{ "classname" "nonexistent_class" }
"#;

    struct Dirs(PathBuf);

    impl Dirs {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!("jamp_sv_{tag}_{}", std::process::id()));
            std::fs::create_dir_all(root.join("maps")).unwrap();
            std::fs::create_dir_all(root.join("base")).unwrap();
            std::fs::write(root.join("maps/arena.ent"), MAP).unwrap();
            std::fs::write(root.join("maps/broken.ent"), r#"{ "classname" "info_null" }"#).unwrap();
            std::fs::write(root.join("base/readme.txt"), b"may the force").unwrap();
            Self(root)
        }
    }

    impl Drop for Dirs {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.0).ok();
        }
    }

    async fn server(tag: &str) -> (GameServer, Dirs) {
        let dirs = Dirs::new(tag);
        let sv = bind_ephemeral(dirs.0.join("maps"), dirs.0.join("base")).await.unwrap();
        (sv, dirs)
    }

    /// Scripted remote end.
    struct Peer {
        addr: SocketAddr,
        chan: Netchan,
        out: Netchan,
        reliable_ack: i32,
        commands: Vec<ReliableCommand>,
        server_id: i32,
        message_ack: i32,
        command_seq: i32,
    }

    impl Peer {
        fn new(port: u16) -> Self {
            Self::at(format!("127.0.0.1:{port}").parse().unwrap())
        }

        fn at(addr: SocketAddr) -> Self {
            Self {
                addr,
                chan: Netchan::new(addr, 77),
                out: Netchan::new(addr, 77),
                reliable_ack: 0,
                commands: Vec::new(),
                server_id: 0,
                message_ack: 0,
                command_seq: 0,
            }
        }

        fn oob(&self, sv: &mut GameServer, msg: Oob) {
            sv.handle_packet(self.addr, &encode_oob(&msg).unwrap());
        }

        fn replies(&mut self, sv: &mut GameServer) -> (Vec<Oob>, Vec<ServerMessage>) {
            let mut oob = Vec::new();
            let mut seq = Vec::new();
            for (to, raw) in sv.take_outbox() {
                if to != self.addr {
                    continue;
                }
                match decode_datagram(&raw, false).unwrap() {
                    Datagram::Connectionless(body) => oob.push(decode_oob(&body).unwrap()),
                    Datagram::Sequenced {
                        sequence,
                        fragment,
                        body,
                        ..
                    } => {
                        if let Some(payload) = self.chan.process(sequence, fragment, body) {
                            let msg: ServerMessage = decode_payload(&payload).unwrap();
                            self.message_ack = sequence;
                            if let Some(last) = msg.commands.last() {
                                self.reliable_ack = self.reliable_ack.max(last.sequence);
                            }
                            if let Some(gs) = &msg.gamestate {
                                self.server_id = gs.server_id;
                                self.reliable_ack = gs.command_sequence;
                            }
                            seq.push(msg);
                        }
                    }
                }
            }
            (oob, seq)
        }

        fn command(&mut self, text: &str) {
            self.command_seq += 1;
            self.commands.push(ReliableCommand {
                sequence: self.command_seq,
                text: text.to_string(),
            });
        }

        fn send(&mut self, sv: &mut GameServer, usercmds: Vec<UserCmd>) {
            let msg = ClientMessage {
                server_id: self.server_id,
                message_acknowledge: self.message_ack,
                reliable_acknowledge: self.reliable_ack,
                commands: self.commands.clone(),
                usercmds,
                no_delta: false,
            };
            let payload = encode_payload(&msg).unwrap();
            for raw in self.out.transmit(&payload, true) {
                sv.handle_packet(self.addr, &raw);
            }
        }

        fn connect(&mut self, sv: &mut GameServer, name: &str) -> Vec<Oob> {
            self.oob(sv, Oob::GetChallenge { client_challenge: 5 });
            let (oob, _) = self.replies(sv);
            let Some(Oob::ChallengeResponse { challenge, .. }) = oob.first().cloned() else {
                panic!("no challenge: {oob:?}");
            };
            let userinfo = format!("\\name\\{name}\\protocol\\{PROTOCOL_VERSION}\\qport\\77\\challenge\\{challenge}");
            self.oob(sv, Oob::Connect { userinfo });
            self.replies(sv).0
        }

        /// Connects and plays until the first snapshot arrives.
        fn enter(&mut self, sv: &mut GameServer, name: &str) -> ServerMessage {
            let reply = self.connect(sv, name);
            assert!(matches!(reply.first(), Some(Oob::ConnectResponse { .. })), "{reply:?}");
            self.send(sv, Vec::new());
            let (_, msgs) = self.replies(sv);
            assert!(msgs.iter().any(|m| m.gamestate.is_some()));
            let cmd = UserCmd {
                server_time: sv.core.time,
                ..Default::default()
            };
            self.send(sv, vec![cmd]);
            sv.frame();
            let (_, msgs) = self.replies(sv);
            msgs.into_iter().find(|m| m.snapshot.is_some()).expect("snapshot")
        }
    }

    #[tokio::test]
    async fn map_load_sets_configstrings_and_state() {
        let (mut sv, _dirs) = server("load").await;
        assert_eq!(sv.state(), ServerState::Dead);
        sv.spawn_server("arena").unwrap();
        assert_eq!(sv.state(), ServerState::Game);
        assert_eq!(sv.core.configstrings[jamp_shared::limits::CS_MESSAGE], "Test Arena");
        assert_eq!(sv.core.cull_distance, 4000.0);
        let systeminfo = &sv.core.configstrings[jamp_shared::limits::CS_SYSTEMINFO];
        assert_eq!(value_for_key(systeminfo, "sv_serverid"), sv.core.server_id.to_string());
        let serverinfo = &sv.core.configstrings[jamp_shared::limits::CS_SERVERINFO];
        assert_eq!(value_for_key(serverinfo, "mapname"), "arena");
    }

    #[tokio::test]
    async fn failed_map_leaves_server_dead() {
        let (mut sv, _dirs) = server("broken").await;
        assert!(matches!(sv.spawn_server("missing"), Err(ServerError::MapNotFound(_))));
        let err = sv.spawn_server("broken").unwrap_err();
        assert!(err.to_string().contains("worldspawn"), "{err}");
        assert_eq!(sv.state(), ServerState::Dead);
        assert!(sv.vms().game().is_none());
    }

    #[tokio::test]
    async fn connect_requires_challenge_and_protocol() {
        let (mut sv, _dirs) = server("challenge").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40001);

        p.oob(&mut sv, Oob::Connect {
            userinfo: format!("\\name\\x\\protocol\\{PROTOCOL_VERSION}\\qport\\77\\challenge\\12345"),
        });
        let (oob, _) = p.replies(&mut sv);
        assert!(matches!(&oob[0], Oob::Print { text } if text.contains("bad challenge")));

        p.oob(&mut sv, Oob::Connect {
            userinfo: "\\name\\x\\protocol\\15".to_string(),
        });
        let (oob, _) = p.replies(&mut sv);
        assert!(matches!(&oob[0], Oob::Print { text } if text.contains("protocol version")));
    }

    #[tokio::test]
    async fn banned_addresses_are_refused() {
        let (mut sv, _dirs) = server("ban").await;
        sv.spawn_server("arena").unwrap();
        let out = sv.exec_console("ban 127.0.0.0/8").unwrap();
        assert_eq!(out, vec!["Added ban: 127.0.0.0/8"]);
        let mut p = Peer::new(40002);
        let reply = p.connect(&mut sv, "Rosh");
        assert!(matches!(&reply[0], Oob::Print { text } if text.contains("banned")));

        assert_eq!(sv.exec_console("unban 127.0.0.0/8").unwrap(), vec!["Removed 1 entries"]);
        let reply = p.connect(&mut sv, "Rosh");
        assert!(matches!(&reply[0], Oob::ConnectResponse { .. }));
    }

    #[tokio::test]
    async fn client_reaches_active_and_gets_deltas() {
        let (mut sv, _dirs) = server("active").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40003);

        let first = p.enter(&mut sv, "Kyle");
        assert_eq!(sv.core.client_state(0), ClientState::Active);
        let snap = first.snapshot.unwrap();
        assert_eq!(snap.delta_num, None);
        assert!(snap.entities.iter().any(|u| u.number == 0));
        assert!(snap.entities.windows(2).all(|w| w[0].number < w[1].number));

        let cmd = UserCmd {
            server_time: sv.core.time,
            forwardmove: 127,
            ..Default::default()
        };
        p.send(&mut sv, vec![cmd]);
        for _ in 0..3 {
            sv.frame();
        }
        let (_, msgs) = p.replies(&mut sv);
        let snap = msgs.into_iter().filter_map(|m| m.snapshot).last().unwrap();
        assert!(snap.delta_num.is_some());
    }

    #[tokio::test]
    async fn reliable_ack_ahead_of_sent_drops_client() {
        let (mut sv, _dirs) = server("ack").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40004);
        p.enter(&mut sv, "Jan");

        p.reliable_ack += 500;
        p.send(&mut sv, Vec::new());
        assert_eq!(sv.core.client_state(0), ClientState::Zombie);
        let (_, msgs) = p.replies(&mut sv);
        assert!(msgs
            .iter()
            .flat_map(|m| &m.commands)
            .any(|c| c.text.starts_with("disconnect")));
    }

    #[tokio::test]
    async fn commands_reach_the_game_in_order() {
        let (mut sv, _dirs) = server("cmds").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40005);
        p.enter(&mut sv, "Kyle");

        p.command("say hello there");
        p.command("bogus");
        p.send(&mut sv, Vec::new());
        p.send(&mut sv, Vec::new());
        sv.frame();
        let (_, msgs) = p.replies(&mut sv);
        let texts: Vec<String> = msgs.into_iter().flat_map(|m| m.commands).map(|c| c.text).collect();
        assert_eq!(texts.iter().filter(|t| t.starts_with("chat \"Kyle: hello there\"")).count(), 1);
        assert!(texts.iter().any(|t| t == "print \"unknown cmd bogus\n\""));

        p.commands.clear();
        p.command_seq += 5;
        p.command("say skipped");
        p.send(&mut sv, Vec::new());
        assert_eq!(sv.core.client_state(0), ClientState::Zombie);
    }

    #[tokio::test]
    async fn timeouts_go_zombie_then_free() {
        let (mut sv, _dirs) = server("timeout").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40006);
        p.enter(&mut sv, "Luke");
        sv.exec_console("sv_timeout 1").unwrap();
        sv.exec_console("sv_zombietime 1").unwrap();
        for _ in 0..25 {
            sv.frame();
        }
        assert_eq!(sv.core.client_state(0), ClientState::Zombie);
        for _ in 0..25 {
            sv.frame();
        }
        assert_eq!(sv.core.client_state(0), ClientState::Free);
    }

    #[tokio::test]
    async fn map_restart_keeps_clients() {
        let (mut sv, _dirs) = server("restart").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40007);
        p.enter(&mut sv, "Tavion");
        let old_id = sv.core.server_id;

        sv.exec_console("map_restart").unwrap();
        assert_eq!(sv.state(), ServerState::Game);
        assert!(sv.core.server_id > old_id);
        assert_eq!(sv.core.restarted_server_id, old_id);
        assert_eq!(sv.core.client_state(0), ClientState::Active);
        let game = sv.vms().game().unwrap();
        let spawn = jamp_shared::math::Vec3::new(64.0, 0.0, 24.0);
        assert!((MAX_CLIENTS..game.num_entities())
            .filter_map(|n| game.shared_entity(n))
            .any(|e| e.s.origin == spawn));

        // Packets still carrying the old id are ignored, not answered with a
        // gamestate.
        p.send(&mut sv, Vec::new());
        let (_, msgs) = p.replies(&mut sv);
        assert!(msgs.iter().all(|m| m.gamestate.is_none()));
        sv.frame();
        let (_, msgs) = p.replies(&mut sv);
        let texts: Vec<String> = msgs.into_iter().flat_map(|m| m.commands).map(|c| c.text).collect();
        assert!(texts.iter().any(|t| t == "map_restart"));
        assert!(texts.iter().any(|t| t.starts_with("cs 1 ")));
    }

    #[tokio::test]
    async fn downloads_are_windowed_and_refused_outside_root() {
        let (mut sv, _dirs) = server("dl").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40008);
        p.enter(&mut sv, "Mara");

        p.command("download ../maps/arena.ent");
        p.send(&mut sv, Vec::new());
        let (_, msgs) = p.replies(&mut sv);
        let refusal = msgs.iter().find_map(|m| m.download.clone()).unwrap();
        assert!(refusal.error.unwrap().contains("illegal path"));

        p.command("download readme.txt");
        p.send(&mut sv, Vec::new());
        sv.frame();
        let (_, msgs) = p.replies(&mut sv);
        let block = msgs.iter().find_map(|m| m.download.clone()).unwrap();
        assert_eq!(block.block, 0);
        assert_eq!(block.data, b"may the force");
        assert_eq!(block.total_size, Some(13));
    }

    #[tokio::test]
    async fn operator_commands() {
        let (mut sv, _dirs) = server("ops").await;
        assert_eq!(sv.exec_console("status").unwrap(), vec!["Server is not running."]);
        sv.exec_console("map arena").unwrap();
        let mut p = Peer::new(40009);
        p.enter(&mut sv, "Desann");

        let status = sv.exec_console("status").unwrap();
        assert!(status[0].contains("arena"));
        assert!(status.iter().any(|l| l.contains("Desann")));

        sv.exec_console("exceptban 10.0.0.1").unwrap();
        let bans = sv.exec_console("listbans").unwrap();
        assert_eq!(bans, vec!["Except 0: 10.0.0.1/32"]);

        let info = sv.exec_console("serverinfo").unwrap();
        assert!(info.iter().any(|l| l.starts_with("mapname")));

        sv.exec_console("kick desann").unwrap();
        assert_eq!(sv.core.client_state(0), ClientState::Zombie);
        assert_eq!(sv.exec_console("kick nobody").unwrap(), vec!["Player nobody is not on the server"]);

        assert!(sv.exec_console("entitylist").unwrap().is_empty());
        let out = sv.exec_console("quit").unwrap();
        assert_eq!(out, vec!["Server shutting down"]);
        assert!(sv.should_quit());
        assert_eq!(sv.state(), ServerState::Dead);
    }

    #[tokio::test]
    async fn server_full_and_status_query() {
        let dirs = Dirs::new("full");
        let cfg = EngineConfig {
            server_addr: "127.0.0.1:0".to_string(),
            maxclients: 1,
            maps_dir: dirs.0.join("maps").display().to_string(),
            ..Default::default()
        };
        let mut sv = GameServer::new(cfg).await.unwrap();
        sv.spawn_server("arena").unwrap();

        let mut a = Peer::new(40010);
        assert!(matches!(a.connect(&mut sv, "A").first(), Some(Oob::ConnectResponse { .. })));
        let mut b = Peer::new(40011);
        b.out = Netchan::new(b.addr, 78);
        b.oob(&mut sv, Oob::GetChallenge { client_challenge: 1 });
        let (oob, _) = b.replies(&mut sv);
        let Some(Oob::ChallengeResponse { challenge, .. }) = oob.first().cloned() else {
            panic!("no challenge");
        };
        b.oob(&mut sv, Oob::Connect {
            userinfo: format!("\\name\\B\\protocol\\{PROTOCOL_VERSION}\\qport\\78\\challenge\\{challenge}"),
        });
        let (oob, _) = b.replies(&mut sv);
        assert!(matches!(&oob[0], Oob::Print { text } if text.contains("Server is full")));

        b.oob(&mut sv, Oob::GetStatus {
            challenge: "xyz".to_string(),
        });
        let (oob, _) = b.replies(&mut sv);
        match &oob[0] {
            Oob::StatusResponse { info, players } => {
                assert_eq!(value_for_key(info, "challenge"), "xyz");
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].name, "A");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn loopback_clients_get_a_snapshot_every_frame() {
        let (mut sv, _dirs) = server("lan").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40012);
        p.enter(&mut sv, "Jaden");

        for _ in 0..4 {
            sv.frame();
            let (_, msgs) = p.replies(&mut sv);
            let snap = msgs.into_iter().find_map(|m| m.snapshot).expect("snapshot");
            assert_eq!(snap.snap_flags & SNAPFLAG_RATE_DELAYED, 0);
        }
    }

    #[tokio::test]
    async fn remote_clients_are_held_to_their_rate() {
        let (mut sv, _dirs) = server("wan").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::at("203.0.113.5:40013".parse().unwrap());
        p.enter(&mut sv, "Rax");
        let client = sv.core.client_mut(0).unwrap();
        assert_eq!(client.rate, 3000);
        client.rate = 1000;

        let mut snaps = 0;
        for _ in 0..4 {
            sv.frame();
            snaps += p.replies(&mut sv).1.into_iter().filter(|m| m.snapshot.is_some()).count();
        }
        assert!(snaps < 4, "{snaps} snapshots");
    }

    #[tokio::test]
    async fn quick_reconnects_are_refused() {
        let (mut sv, _dirs) = server("reconnect").await;
        sv.spawn_server("arena").unwrap();
        let mut p = Peer::new(40014);
        p.enter(&mut sv, "Corran");

        let reply = p.connect(&mut sv, "Corran");
        assert!(matches!(&reply[0], Oob::Print { text } if text.contains("too soon")), "{reply:?}");
        assert_eq!(sv.core.client_state(0), ClientState::Active);

        for _ in 0..3000 / (1000 / sv.core.sv_fps()) {
            sv.frame();
        }
        sv.take_outbox();
        let reply = p.connect(&mut sv, "Corran");
        assert!(matches!(reply.first(), Some(Oob::ConnectResponse { .. })), "{reply:?}");
        assert_eq!(sv.core.client_state(0), ClientState::Connected);
    }
}
