//! Client implementation.
//!
//! `GameClient` owns the socket side of a connection:
//! - the `getchallenge`/`connect` handshake
//! - the sequenced channel (fragment reassembly, qport)
//! - one outgoing packet per frame carrying acknowledgements, pending
//!   reliable commands and the frame's usercmd
//! - userinfo updates and the operator console
//!
//! Everything the server says is interpreted by the `ClientSession`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jamp_shared::config::EngineConfig;
use jamp_shared::console::{Console, CvarFlags, CvarValue};
use jamp_shared::info::set_value_for_key;
use jamp_shared::limits::PROTOCOL_VERSION;
use jamp_shared::net::{decode_oob, decode_payload, encode_payload, Datagram, Netchan, Oob, ServerMessage, UnreliableConn};

use crate::input::{build_command, InputState};
use crate::session::{ClientSession, ConnState};

const CHALLENGE_RETRIES: usize = 3;
const RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// A connected game client.
pub struct GameClient {
    pub console: Console,
    pub session: ClientSession,
    pub input: InputState,
    conn: UnreliableConn,
    netchan: Netchan,
    last_cmd_time: i32,
}

impl GameClient {
    /// Performs the challenge handshake and connects.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, "Connecting to server");

        let bind_ip = if server_addr.ip().is_loopback() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let conn = UnreliableConn::connect(SocketAddr::new(bind_ip, 0), server_addr).await?;

        let mut console = Console::new();
        Self::register_cvars(&mut console, cfg);

        let qport: u16 = rand::thread_rng().gen();
        let client_challenge: i32 = rand::thread_rng().gen::<i32>() & 0x7fff_ffff;
        let challenge = Self::get_challenge(&conn, client_challenge).await?;
        debug!(challenge, "challenge received");

        let userinfo = Self::connect_userinfo(&console, challenge, qport)?;
        conn.send_oob(&Oob::Connect { userinfo }).await?;
        loop {
            match Self::recv_oob(&conn, RETRY_INTERVAL * 3).await? {
                Some(Oob::ConnectResponse { .. }) => break,
                Some(Oob::Print { text }) => bail!("{}", text.trim_end()),
                Some(other) => debug!(?other, "ignored while connecting"),
                None => bail!("no connect response from {server_addr}"),
            }
        }
        info!(server = %server_addr, qport, "Connected to server");

        let mut client = Self {
            session: ClientSession::new(PathBuf::from(&cfg.download_dir)),
            console,
            input: InputState::default(),
            conn,
            netchan: Netchan::new(server_addr, qport),
            last_cmd_time: 0,
        };
        client.console.cvars_mut().take_modified(CvarFlags::USERINFO);
        // The server answers the first sequenced packet with the gamestate.
        client.send_packet(Vec::new()).await?;
        Ok(client)
    }

    fn register_cvars(console: &mut Console, cfg: &EngineConfig) {
        console.register_cvar(
            "name",
            CvarValue::String(cfg.player_name.clone()),
            CvarFlags::USERINFO | CvarFlags::ARCHIVE,
            "Player name",
        );
        console.register_cvar("rate", CvarValue::Int(25000), CvarFlags::USERINFO | CvarFlags::ARCHIVE, "");
        console.register_cvar("snaps", CvarValue::Int(20), CvarFlags::USERINFO | CvarFlags::ARCHIVE, "");
        console.register_cvar("model", CvarValue::String("kyle/default".into()), CvarFlags::USERINFO, "");
    }

    fn connect_userinfo(console: &Console, challenge: i32, qport: u16) -> anyhow::Result<String> {
        let mut info = console.cvars().info_string(CvarFlags::USERINFO);
        for (key, value) in [
            ("protocol", PROTOCOL_VERSION.to_string()),
            ("qport", qport.to_string()),
            ("challenge", challenge.to_string()),
        ] {
            info = set_value_for_key(&info, key, &value)?;
        }
        Ok(info)
    }

    async fn get_challenge(conn: &UnreliableConn, client_challenge: i32) -> anyhow::Result<i32> {
        for attempt in 1..=CHALLENGE_RETRIES {
            conn.send_oob(&Oob::GetChallenge { client_challenge }).await?;
            match Self::recv_oob(conn, RETRY_INTERVAL).await? {
                Some(Oob::ChallengeResponse {
                    challenge,
                    client_challenge: echoed,
                }) if echoed == client_challenge => return Ok(challenge),
                Some(Oob::Print { text }) => bail!("{}", text.trim_end()),
                other => debug!(attempt, ?other, "no challenge yet"),
            }
        }
        bail!("server did not answer getchallenge")
    }

    async fn recv_oob(conn: &UnreliableConn, timeout: Duration) -> anyhow::Result<Option<Oob>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match conn.recv_timeout(left).await? {
                Some(Datagram::Connectionless(body)) => return Ok(Some(decode_oob(&body)?)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    pub fn state(&self) -> ConnState {
        self.session.state
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.conn.local_addr()
    }

    /// Receives for up to `timeout`, handling every datagram that arrives.
    /// Returns the number of server messages processed.
    pub async fn poll(&mut self, timeout: Duration) -> anyhow::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut handled = 0;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let Some(datagram) = self.conn.recv_timeout(left).await? else {
                return Ok(handled);
            };
            if self.handle_datagram(datagram) {
                handled += 1;
            }
            if left.is_zero() {
                return Ok(handled);
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram) -> bool {
        match datagram {
            Datagram::Connectionless(body) => {
                match decode_oob(&body) {
                    Ok(Oob::Print { text }) => info!(target: "server", "{}", text.trim_end()),
                    Ok(Oob::Disconnect) => self.session.state = ConnState::Disconnected,
                    Ok(other) => debug!(?other, "stray connectionless message"),
                    Err(e) => debug!(error = %e, "bad connectionless message"),
                }
                false
            }
            Datagram::Sequenced {
                sequence,
                fragment,
                body,
                ..
            } => {
                let Some(payload) = self.netchan.process(sequence, fragment, body) else {
                    return false;
                };
                match decode_payload::<ServerMessage>(&payload) {
                    Ok(msg) => {
                        self.session.handle_message(sequence, msg);
                        true
                    }
                    Err(e) => {
                        warn!(sequence, error = %e, "undecodable server message");
                        false
                    }
                }
            }
        }
    }

    /// Sends one sequenced packet.
    async fn send_packet(&mut self, usercmds: Vec<jamp_shared::entity_state::UserCmd>) -> anyhow::Result<()> {
        let msg = self.session.build_message(usercmds);
        let payload = encode_payload(&msg)?;
        for datagram in self.netchan.transmit(&payload, true) {
            self.conn.send(&datagram).await?;
        }
        Ok(())
    }

    /// Server time for the next usercmd; strictly increasing.
    fn next_cmd_time(&mut self) -> i32 {
        let snap_time = self.session.snap.as_ref().map_or(0, |s| s.server_time);
        self.last_cmd_time = snap_time.max(self.last_cmd_time + 1);
        self.last_cmd_time
    }

    /// `CL_SendCmd`: userinfo changes, then a packet with this frame's
    /// usercmd once the gamestate is in.
    pub async fn send_cmd(&mut self) -> anyhow::Result<()> {
        if self.session.state == ConnState::Disconnected {
            return Ok(());
        }
        if self.console.cvars_mut().take_modified(CvarFlags::USERINFO) {
            let info = self.console.cvars().info_string(CvarFlags::USERINFO);
            self.command(&format!("userinfo \"{info}\""))?;
        }
        let usercmds = if self.session.state >= ConnState::Primed {
            let time = self.next_cmd_time();
            vec![build_command(time, &self.input)]
        } else {
            Vec::new()
        };
        self.send_packet(usercmds).await
    }

    /// One client frame: receive for up to `frame`, then send.
    pub async fn frame(&mut self, frame: Duration) -> anyhow::Result<()> {
        self.poll(frame).await?;
        self.send_cmd().await
    }

    /// Runs frames until `done` holds or `timeout` passes. Returns whether
    /// `done` held.
    pub async fn run_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&ClientSession) -> bool,
    ) -> anyhow::Result<bool> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done(&self.session) {
                return Ok(true);
            }
            self.frame(Duration::from_millis(20)).await?;
        }
        Ok(done(&self.session))
    }

    /// Queues a reliable command for the server.
    pub fn command(&mut self, text: &str) -> anyhow::Result<()> {
        self.session.add_command(text)?;
        Ok(())
    }

    /// Sends `disconnect` a few times, since nothing will resend it.
    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.session.state == ConnState::Disconnected {
            return Ok(());
        }
        self.command("disconnect")?;
        for _ in 0..3 {
            self.send_packet(Vec::new()).await?;
        }
        self.session.state = ConnState::Disconnected;
        info!("Disconnected");
        Ok(())
    }

    /// Executes a console line.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens = jamp_shared::parse::tokenize_line(line.trim());
        let Some(cmd) = tokens.first().map(|t| t.to_ascii_lowercase()) else {
            return Ok(Vec::new());
        };
        let rest = tokens[1..].join(" ");

        match cmd.as_str() {
            "say" | "say_team" | "tell" | "kill" | "callvote" | "vote" => {
                self.command(line.trim())?;
                Ok(Vec::new())
            }
            "cmd" => {
                self.command(&rest)?;
                Ok(Vec::new())
            }
            "download" => {
                if rest.is_empty() {
                    return Ok(vec!["Usage: download <path>".to_string()]);
                }
                self.session.begin_download(&rest)?;
                Ok(Vec::new())
            }
            "disconnect" => {
                self.disconnect().await?;
                Ok(vec!["Disconnected".to_string()])
            }
            "status" => {
                let s = &self.session;
                let mut out = vec![
                    format!("state: {:?}", s.state),
                    format!("client: {}", s.client_num),
                    format!("server id: {}", s.server_id),
                    format!("server message: {}", s.server_message_sequence),
                ];
                if let Some(snap) = &s.snap {
                    out.push(format!(
                        "snapshot: {} (time {}, {} entities)",
                        snap.message_num,
                        snap.server_time,
                        snap.entities.len()
                    ));
                }
                Ok(out)
            }
            "configstrings" => Ok(self
                .session
                .configstrings
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_empty())
                .map(|(i, v)| format!("{i:4}: {v}"))
                .collect()),
            "forward" | "right" | "up" => {
                let amount = jamp_shared::parse::atof(&rest);
                match cmd.as_str() {
                    "forward" => self.input.forward = amount,
                    "right" => self.input.right = amount,
                    _ => self.input.up = amount,
                }
                Ok(Vec::new())
            }
            _ => self.console.exec(line),
        }
    }
}
