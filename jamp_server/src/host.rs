//! The engine side of the game module boundary.
//!
//! `ServerCore` holds everything a game syscall may touch: configstrings,
//! client slots, the entity link table, cvars, the persistent data store and
//! the entity text being spawned. It is handed to the game as
//! `&mut dyn GameImport` for the duration of each export call.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use jamp_shared::console::{Console, CvarFlags, CvarValue};
use jamp_shared::entity_state::SharedEntity;
use jamp_shared::game_api::GameImport;
use jamp_shared::limits::{MAX_CONFIGSTRINGS, MAX_STRING_CHARS};
use jamp_shared::net::{encode_payload, ServerMessage};
use jamp_shared::parse::Tokenizer;
use jamp_shared::persist::PersistentStore;

use crate::client::{Client, ClientState};
use crate::error::{DropReason, ServerError};
use crate::world::World;

/// Longest configstring sent in one `cs` command; longer ones are split
/// into `bcs0`/`bcs1`/`bcs2` pieces.
const MAX_CS_CHUNK: usize = MAX_STRING_CHARS - 24;

/// Default snapshot distance cull.
pub const DEFAULT_CULL_DISTANCE: f32 = 6000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    /// No map running.
    #[default]
    Dead,
    /// Spawning a level; configstrings are not broadcast.
    Loading,
    Game,
}

/// Resolves `<dir>/<name>.ent`, refusing names that leave `dir`.
pub fn entity_file(dir: &Path, name: &str) -> Result<PathBuf, ServerError> {
    let ok = !name.is_empty() && Path::new(name).components().all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(ServerError::BadMapName(name.to_string()));
    }
    Ok(dir.join(format!("{name}.ent")))
}

/// Tokens of an entity file, consumed front to back.
fn tokenize_reversed(text: &str) -> Vec<String> {
    let mut t = Tokenizer::new(text);
    let mut out: Vec<String> = std::iter::from_fn(|| t.next_token()).collect();
    out.reverse();
    out
}

pub struct ServerCore {
    pub state: ServerState,
    /// Server time in milliseconds.
    pub time: i32,
    pub server_id: i32,
    /// Id before the last `map_restart`; packets carrying it are ignored.
    pub restarted_server_id: i32,
    pub checksum_feed: i32,
    pub restarting: bool,
    pub map_name: String,
    pub configstrings: Vec<String>,
    pub clients: Vec<Option<Client>>,
    pub world: World,
    pub console: Console,
    pub pd: PersistentStore,
    pub cull_distance: f32,
    maps_dir: PathBuf,
    entity_text: String,
    entity_tokens: Vec<String>,
    entity_stack: Vec<Vec<String>>,
    /// Arguments of the command currently handed to the game.
    pub args: Vec<String>,
    /// Drops requested during a module call; applied when it returns.
    pub pending_drops: Vec<(usize, DropReason)>,
    /// Datagrams waiting for the socket.
    pub outbox: Vec<(SocketAddr, Bytes)>,
    started: Instant,
}

impl ServerCore {
    pub fn new(console: Console, maps_dir: PathBuf, max_clients: usize) -> Self {
        Self {
            state: ServerState::Dead,
            time: 0,
            server_id: 0,
            restarted_server_id: 0,
            checksum_feed: 0,
            restarting: false,
            map_name: String::new(),
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            clients: std::iter::repeat_with(|| None).take(max_clients).collect(),
            world: World::new(),
            console,
            pd: PersistentStore::new(),
            cull_distance: DEFAULT_CULL_DISTANCE,
            maps_dir,
            entity_text: String::new(),
            entity_tokens: Vec::new(),
            entity_stack: Vec::new(),
            args: Vec::new(),
            pending_drops: Vec::new(),
            outbox: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn maps_dir(&self) -> &Path {
        &self.maps_dir
    }

    /// Reads the entity text of `map` and makes it the parse point.
    pub fn load_entities(&mut self, map: &str) -> Result<(), ServerError> {
        let path = entity_file(&self.maps_dir, map)?;
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServerError::MapNotFound(map.to_string()),
            _ => ServerError::Io {
                path: path.display().to_string(),
                source: e,
            },
        })?;
        self.entity_text = text;
        self.rewind_entities();
        Ok(())
    }

    /// Moves the parse point back to the first entity of the loaded map.
    pub fn rewind_entities(&mut self) {
        self.entity_tokens = tokenize_reversed(&self.entity_text);
        self.entity_stack.clear();
    }

    /// Clears per-level state ahead of a new map.
    pub fn clear_level(&mut self) {
        self.configstrings.iter_mut().for_each(String::clear);
        self.world.clear();
        self.entity_text.clear();
        self.entity_tokens.clear();
        self.entity_stack.clear();
        self.cull_distance = DEFAULT_CULL_DISTANCE;
    }

    pub fn client(&self, idx: usize) -> Option<&Client> {
        self.clients.get(idx).and_then(Option::as_ref)
    }

    pub fn client_mut(&mut self, idx: usize) -> Option<&mut Client> {
        self.clients.get_mut(idx).and_then(Option::as_mut)
    }

    pub fn client_state(&self, idx: usize) -> ClientState {
        self.client(idx).map_or(ClientState::Free, |c| c.state)
    }

    pub fn max_rate(&self) -> i32 {
        self.console.cvars().int("sv_maxRate") as i32
    }

    /// Whether LAN clients skip the rate limit.
    pub fn lan_force_rate(&self) -> bool {
        self.console.cvars().int("sv_lanForceRate") != 0
    }

    pub fn sv_fps(&self) -> i32 {
        (self.console.cvars().int("sv_fps") as i32).clamp(1, 1000)
    }

    /// `SV_AddServerCommand`. A client whose ring is full is dropped at the
    /// next opportunity rather than lose the command.
    pub fn add_server_command(&mut self, idx: usize, text: &str) {
        let Some(client) = self.client_mut(idx) else {
            return;
        };
        match client.reliable.push(text) {
            Ok(_) => {}
            Err(e @ jamp_shared::reliable::ChannelError::CommandTooLong(_)) => {
                warn!(client = idx, error = %e, "server command not sent");
            }
            Err(e) => {
                warn!(client = idx, name = %client.name, error = %e, "dropping client");
                self.pending_drops.push((idx, DropReason::Channel(e)));
            }
        }
    }

    /// Sends configstring `index` to one client, split if long.
    pub fn send_configstring(&mut self, idx: usize, index: usize) {
        let value = self.configstrings[index].clone();
        if value.len() < MAX_CS_CHUNK {
            self.add_server_command(idx, &format!("cs {index} \"{value}\""));
            return;
        }
        let mut rest = value.as_str();
        let mut first = true;
        while !rest.is_empty() {
            let mut cut = rest.len().min(MAX_CS_CHUNK);
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            let (chunk, tail) = rest.split_at(cut);
            let cmd = match (first, tail.is_empty()) {
                (true, _) => "bcs0",
                (false, false) => "bcs1",
                (false, true) => "bcs2",
            };
            self.add_server_command(idx, &format!("{cmd} {index} \"{chunk}\""));
            first = false;
            rest = tail;
        }
    }

    /// Rebuilds the serverinfo/systeminfo configstrings when their cvars
    /// changed, or unconditionally with `force`.
    pub fn update_info_configstrings(&mut self, force: bool) {
        let cvars = self.console.cvars_mut();
        if cvars.take_modified(CvarFlags::SERVERINFO) || force {
            let info = cvars.info_string(CvarFlags::SERVERINFO);
            self.set_configstring(jamp_shared::limits::CS_SERVERINFO, &info);
        }
        let cvars = self.console.cvars_mut();
        if cvars.take_modified(CvarFlags::SYSTEMINFO) || force {
            let info = cvars.info_string(CvarFlags::SYSTEMINFO);
            self.set_configstring(jamp_shared::limits::CS_SYSTEMINFO, &info);
        }
    }

    /// Frames `msg` for client `idx` with its pending reliable commands and
    /// queues the datagrams. Returns the message number and payload size.
    pub fn transmit(&mut self, idx: usize, mut msg: ServerMessage) -> Option<(i32, usize)> {
        let client = self.clients.get_mut(idx).and_then(Option::as_mut)?;
        msg.reliable_acknowledge = client.commands.last();
        msg.commands = client.reliable.pending();
        let payload = match encode_payload(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(client = idx, error = %e, "could not encode message");
                return None;
            }
        };
        let message_num = client.netchan.outgoing_sequence;
        let addr = client.addr();
        for datagram in client.netchan.transmit(&payload, false) {
            self.outbox.push((addr, datagram));
        }
        Some((message_num, payload.len()))
    }

    pub fn push_oob(&mut self, to: SocketAddr, msg: &jamp_shared::net::Oob) {
        match jamp_shared::net::encode_oob(msg) {
            Ok(b) => self.outbox.push((to, b)),
            Err(e) => warn!(%to, error = %e, "could not encode reply"),
        }
    }

    fn cvar_value(default: &str) -> CvarValue {
        if let Ok(v) = default.parse::<i64>() {
            CvarValue::Int(v)
        } else if let Ok(v) = default.parse::<f64>() {
            CvarValue::Float(v)
        } else {
            CvarValue::String(default.to_string())
        }
    }
}

impl GameImport for ServerCore {
    fn print(&mut self, msg: &str) {
        info!(target: "game", "{}", msg.trim_end());
    }

    fn milliseconds(&self) -> i32 {
        self.started.elapsed().as_millis() as i32
    }

    fn cvar_register(&mut self, name: &str, default: &str, flags: CvarFlags) {
        self.console.register_cvar(name, Self::cvar_value(default), flags, "");
    }

    fn cvar_string(&self, name: &str) -> String {
        self.console.cvars().string(name)
    }

    fn cvar_int(&self, name: &str) -> i64 {
        self.console.cvars().int(name)
    }

    fn cvar_set(&mut self, name: &str, value: &str) {
        if let Err(e) = self.console.cvars_mut().force_set(name, value) {
            warn!(cvar = name, error = %e, "cvar_set");
        }
    }

    fn get_configstring(&self, index: usize) -> String {
        self.configstrings.get(index).cloned().unwrap_or_default()
    }

    /// `SV_SetConfigstring`: unchanged values are ignored; otherwise loaded
    /// clients get the new value now and connecting ones once primed.
    fn set_configstring(&mut self, index: usize, value: &str) {
        let Some(slot) = self.configstrings.get_mut(index) else {
            warn!(index, "SV_SetConfigstring: bad index");
            return;
        };
        if slot == value {
            return;
        }
        *slot = value.to_string();

        if self.state != ServerState::Game && !self.restarting {
            return;
        }
        for idx in 0..self.clients.len() {
            match self.client_state(idx) {
                ClientState::Primed | ClientState::Active => self.send_configstring(idx, index),
                ClientState::Connected => {
                    if let Some(c) = self.client_mut(idx) {
                        c.pending_configstrings.insert(index);
                    }
                }
                _ => {}
            }
        }
    }

    fn get_serverinfo(&self) -> String {
        self.console.cvars().info_string(CvarFlags::SERVERINFO)
    }

    fn get_userinfo(&self, client: usize) -> String {
        self.client(client).map(|c| c.userinfo.clone()).unwrap_or_default()
    }

    fn set_userinfo(&mut self, client: usize, info: &str) {
        if let Some(c) = self.client_mut(client) {
            c.userinfo = info.to_string();
        }
    }

    fn get_entity_token(&mut self) -> Option<String> {
        self.entity_tokens.pop()
    }

    fn set_active_sub_bsp(&mut self, name: Option<&str>) -> bool {
        let Some(name) = name else {
            if let Some(outer) = self.entity_stack.pop() {
                self.entity_tokens = outer;
            }
            return true;
        };
        let text = entity_file(&self.maps_dir, name).and_then(|path| {
            std::fs::read_to_string(&path).map_err(|_| ServerError::MapNotFound(name.to_string()))
        });
        match text {
            Ok(text) => {
                let sub = tokenize_reversed(&text);
                self.entity_stack.push(std::mem::replace(&mut self.entity_tokens, sub));
                debug!(sub_bsp = name, depth = self.entity_stack.len(), "entity parse point switched");
                true
            }
            Err(e) => {
                warn!(sub_bsp = name, error = %e, "no entity text");
                false
            }
        }
    }

    fn set_server_cull(&mut self, distance: f32) {
        self.cull_distance = distance;
    }

    fn link_entity(&mut self, ent: &mut SharedEntity) {
        self.world.link(ent);
    }

    fn unlink_entity(&mut self, ent: &mut SharedEntity) {
        self.world.unlink(ent);
    }

    /// `None` reaches every client that has its gamestate.
    fn send_server_command(&mut self, client: Option<usize>, text: &str) {
        match client {
            Some(idx) => self.add_server_command(idx, text),
            None => {
                if text.starts_with("print") {
                    debug!(target: "broadcast", "{}", text);
                }
                for idx in 0..self.clients.len() {
                    if self.client_state(idx) >= ClientState::Primed {
                        self.add_server_command(idx, text);
                    }
                }
            }
        }
    }

    fn drop_client(&mut self, client: usize, reason: &str) {
        self.pending_drops.push((client, DropReason::Game(reason.to_string())));
    }

    fn argc(&self) -> usize {
        self.args.len()
    }

    fn argv(&self, n: usize) -> String {
        self.args.get(n).cloned().unwrap_or_default()
    }

    fn pd_store(&mut self, name: &str, data: Bytes) -> bool {
        self.pd.store(name, data).is_ok()
    }

    fn pd_load(&mut self, name: &str) -> Option<Bytes> {
        self.pd.load(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ServerCore {
        ServerCore::new(Console::new(), PathBuf::from("maps"), 4)
    }

    fn connect(core: &mut ServerCore, idx: usize, state: ClientState) {
        let addr: SocketAddr = format!("127.0.0.1:{}", 5000 + idx).parse().unwrap();
        let mut c = Client::new(addr, idx as u16, 1, String::new(), 0);
        c.state = state;
        core.clients[idx] = Some(c);
    }

    fn texts(core: &ServerCore, idx: usize) -> Vec<String> {
        core.client(idx).unwrap().reliable.pending().into_iter().map(|c| c.text).collect()
    }

    #[test]
    fn configstrings_reach_loaded_clients_only() {
        let mut core = core();
        connect(&mut core, 0, ClientState::Active);
        connect(&mut core, 1, ClientState::Connected);

        core.set_configstring(3, "quiet before the game");
        assert!(texts(&core, 0).is_empty());

        core.state = ServerState::Game;
        core.set_configstring(3, "Welcome");
        core.set_configstring(3, "Welcome");
        assert_eq!(texts(&core, 0), vec!["cs 3 \"Welcome\""]);
        assert!(texts(&core, 1).is_empty());
        assert!(core.client(1).unwrap().pending_configstrings.contains(&3));
    }

    #[test]
    fn long_configstrings_are_split() {
        let mut core = core();
        core.state = ServerState::Game;
        connect(&mut core, 0, ClientState::Primed);
        core.set_configstring(700, &"x".repeat(MAX_CS_CHUNK * 2 + 10));
        let sent = texts(&core, 0);
        assert_eq!(sent.len(), 3);
        assert!(sent[0].starts_with("bcs0 700 \""));
        assert!(sent[1].starts_with("bcs1 700 \""));
        assert!(sent[2].starts_with("bcs2 700 \""));
    }

    #[test]
    fn overflow_defers_a_drop() {
        let mut core = core();
        connect(&mut core, 2, ClientState::Active);
        for i in 0..=jamp_shared::limits::MAX_RELIABLE_COMMANDS {
            core.send_server_command(Some(2), &format!("print \"{i}\""));
        }
        assert_eq!(core.pending_drops.len(), 1);
        assert_eq!(core.pending_drops[0].0, 2);
    }

    #[test]
    fn broadcast_skips_clients_without_gamestate() {
        let mut core = core();
        connect(&mut core, 0, ClientState::Primed);
        connect(&mut core, 1, ClientState::Connected);
        core.send_server_command(None, "print \"hi\n\"");
        assert_eq!(texts(&core, 0).len(), 1);
        assert!(texts(&core, 1).is_empty());
    }

    #[test]
    fn registered_cvars_take_the_default_type() {
        let mut core = core();
        core.cvar_register("g_gravity", "800", CvarFlags::NONE);
        core.cvar_register("g_motd", "", CvarFlags::NONE);
        core.cvar_set("g_gravity", "600");
        assert_eq!(core.cvar_int("g_gravity"), 600);
        core.cvar_set("g_gravity", "heavy");
        assert_eq!(core.cvar_int("g_gravity"), 600);
        core.cvar_set("g_motd", "hello there");
        assert_eq!(core.cvar_string("g_motd"), "hello there");
    }

    #[test]
    fn map_names_stay_in_the_maps_dir() {
        let dir = Path::new("maps");
        assert_eq!(entity_file(dir, "mp/ffa1").unwrap(), dir.join("mp/ffa1.ent"));
        assert!(entity_file(dir, "../etc/passwd").is_err());
        assert!(entity_file(dir, "").is_err());
    }

    #[test]
    fn sub_bsp_text_is_stacked() {
        let dir = std::env::temp_dir().join(format!("jamp_host_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.ent"), "{ \"classname\" \"worldspawn\" }").unwrap();
        std::fs::write(dir.join("inner.ent"), "{ \"classname\" \"info_null\" }").unwrap();

        let mut core = ServerCore::new(Console::new(), dir.clone(), 1);
        core.load_entities("main").unwrap();
        assert_eq!(core.get_entity_token().as_deref(), Some("{"));
        assert!(core.set_active_sub_bsp(Some("inner")));
        assert_eq!(core.get_entity_token().as_deref(), Some("{"));
        assert_eq!(core.get_entity_token().as_deref(), Some("classname"));
        assert!(!core.set_active_sub_bsp(Some("missing")));
        assert!(core.set_active_sub_bsp(None));
        assert_eq!(core.get_entity_token().as_deref(), Some("classname"));
        assert_eq!(core.get_entity_token().as_deref(), Some("worldspawn"));

        assert!(matches!(core.load_entities("nope"), Err(ServerError::MapNotFound(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rewind_restarts_the_entity_parse() {
        let dir = std::env::temp_dir().join(format!("jamp_rewind_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.ent"), "{ \"classname\" \"worldspawn\" }").unwrap();
        std::fs::write(dir.join("inner.ent"), "{ }").unwrap();

        let mut core = ServerCore::new(Console::new(), dir.clone(), 1);
        core.load_entities("main").unwrap();
        while core.get_entity_token().is_some() {}
        assert!(core.set_active_sub_bsp(Some("inner")));

        core.rewind_entities();
        let tokens: Vec<String> = std::iter::from_fn(|| core.get_entity_token()).collect();
        assert_eq!(tokens, vec!["{", "classname", "worldspawn", "}"]);

        core.clear_level();
        core.rewind_entities();
        assert_eq!(core.get_entity_token(), None);
        std::fs::remove_dir_all(&dir).ok();
    }
}
