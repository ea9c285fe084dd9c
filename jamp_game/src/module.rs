//! The server game module: `GameExport` over the entity table.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jamp_shared::console::CvarFlags;
use jamp_shared::entity_state::{EntityType, PlayerState, SharedEntity, SvFlags, UserCmd};
use jamp_shared::game_api::{GameError, GameExport, GameImport};
use jamp_shared::info::{clean_name, value_for_key};
use jamp_shared::limits::{
    CS_AMBIENT_SOUNDSETS, CS_MODELS, CS_PLAYERS, CS_SOUNDS, CS_WARMUP, MAX_AMBIENT_SETS, MAX_CLIENTS, MAX_MODELS,
    MAX_SOUNDS,
};
use jamp_shared::math::{Vec3, PITCH, YAW};
use jamp_shared::vm::{Module, ModuleLoader, VmError, VmSlot};

use crate::entity::EntityTable;
use crate::level::{Gametype, LevelLocals, Team};
use crate::spawn::{spawn_entities_from_string, FieldTable, SpawnRegistry, GAME_VERSION};
use crate::spawn_funcs::default_registry;

/// Key under which sessions survive a map restart.
pub const SESSION_STORE: &str = "g_sessions";

const DEFAULT_NAME: &str = "Padawan";
const DEFAULT_VIEWHEIGHT: i32 = 26;

/// Per-client data that survives a map restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSession {
    pub team: Team,
    pub wins: i32,
    pub losses: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConnection {
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct GClient {
    pub ps: PlayerState,
    pub netname: String,
    pub session: ClientSession,
    pub connected: ClientConnection,
    pub is_bot: bool,
    pub enter_time: i32,
}

pub struct GameModule {
    pub level: LevelLocals,
    pub entities: EntityTable,
    pub clients: Vec<Option<GClient>>,
    pub fields: Arc<FieldTable>,
    pub spawns: Arc<SpawnRegistry>,
    restored_sessions: Vec<Option<ClientSession>>,
}

impl Default for GameModule {
    fn default() -> Self {
        Self::new()
    }
}

impl GameModule {
    pub fn new() -> Self {
        Self {
            level: LevelLocals::default(),
            entities: EntityTable::new(),
            clients: vec![None; MAX_CLIENTS],
            fields: Arc::new(FieldTable::new()),
            spawns: Arc::new(default_registry()),
            restored_sessions: Vec::new(),
        }
    }

    pub fn client(&self, client: usize) -> Option<&GClient> {
        self.clients.get(client).and_then(Option::as_ref)
    }

    /// Unlinks and releases an entity.
    pub fn free_entity(&mut self, sys: &mut dyn GameImport, num: usize) {
        if let Some(e) = self.entities.get_mut(num) {
            sys.unlink_entity(&mut e.shared);
        }
        self.entities.free(num, self.level.time);
    }

    /// `G_FindConfigstringIndex`: slot of `name` in `start+1..start+max`,
    /// registering it in the first empty slot. 0 means none.
    fn configstring_index(sys: &mut dyn GameImport, name: &str, start: usize, max: usize) -> i32 {
        if name.is_empty() {
            return 0;
        }
        for i in 1..max {
            let current = sys.get_configstring(start + i);
            if current.is_empty() {
                sys.set_configstring(start + i, name);
                return i as i32;
            }
            if current.eq_ignore_ascii_case(name) {
                return i as i32;
            }
        }
        warn!(name, start, "G_FindConfigstringIndex: overflow");
        0
    }

    pub fn model_index(&mut self, sys: &mut dyn GameImport, name: &str) -> i32 {
        Self::configstring_index(sys, name, CS_MODELS, MAX_MODELS)
    }

    pub fn sound_index(&mut self, sys: &mut dyn GameImport, name: &str) -> i32 {
        Self::configstring_index(sys, name, CS_SOUNDS, MAX_SOUNDS)
    }

    pub fn soundset_index(&mut self, sys: &mut dyn GameImport, name: &str) -> i32 {
        Self::configstring_index(sys, name, CS_AMBIENT_SOUNDSETS, MAX_AMBIENT_SETS)
    }

    fn register_cvars(sys: &mut dyn GameImport) {
        sys.cvar_register("gamename", GAME_VERSION, CvarFlags::SERVERINFO | CvarFlags::ROM);
        sys.cvar_register("g_gametype", "0", CvarFlags::SERVERINFO | CvarFlags::LATCH);
        sys.cvar_register("g_gravity", "800", CvarFlags::NONE);
        sys.cvar_register("g_motd", "", CvarFlags::NONE);
        sys.cvar_register("g_password", "", CvarFlags::USERINFO);
        sys.cvar_register("g_restarted", "0", CvarFlags::ROM);
        sys.cvar_register("g_doWarmup", "0", CvarFlags::NONE);
        sys.cvar_register("g_warmup", "20", CvarFlags::ARCHIVE);
    }

    fn session_for(&self, client: usize, first_time: bool) -> ClientSession {
        if !first_time {
            if let Some(Some(s)) = self.restored_sessions.get(client) {
                return s.clone();
            }
        }
        let team = if self.level.gametype.is_team() {
            self.pick_team()
        } else {
            Team::Free
        };
        ClientSession {
            team,
            ..Default::default()
        }
    }

    /// Team with fewer players, red on ties.
    fn pick_team(&self) -> Team {
        let count = |t: Team| self.clients.iter().flatten().filter(|c| c.session.team == t).count();
        if count(Team::Blue) < count(Team::Red) {
            Team::Blue
        } else {
            Team::Red
        }
    }

    fn spawn_point(&self) -> Vec3 {
        self.entities
            .find_by_classname("info_player_deathmatch")
            .first()
            .and_then(|&n| self.entities.get(n))
            .map(|e| e.shared.s.origin + Vec3::new(0.0, 0.0, 9.0))
            .unwrap_or(Vec3::ZERO)
    }

    /// Places `client` at a spawn point with fresh player state.
    fn respawn(&mut self, sys: &mut dyn GameImport, client: usize) {
        let origin = self.spawn_point();
        let Some(gc) = self.clients.get_mut(client).and_then(Option::as_mut) else {
            return;
        };
        let command_time = gc.ps.command_time;
        gc.ps = PlayerState {
            origin,
            client_num: client as i32,
            view_height: DEFAULT_VIEWHEIGHT,
            command_time,
            ..Default::default()
        };
        gc.ps.gravity = sys.cvar_int("g_gravity") as i32;

        let ent = self.entities.init_client_entity(client);
        ent.classname = "player".to_string();
        ent.shared.s.e_type = EntityType::Player;
        ent.shared.s.client_num = client as i32;
        ent.shared.r.svflags = SvFlags::PLAYER_USABLE;
        ent.shared.r.mins = Vec3::new(-15.0, -15.0, -24.0);
        ent.shared.r.maxs = Vec3::new(15.0, 15.0, 40.0);
        ent.health = 100;
        ent.set_origin(origin);
        sys.link_entity(&mut ent.shared);
    }

    /// Copies player state into the player's entity and relinks it.
    fn player_state_to_entity(&mut self, sys: &mut dyn GameImport, client: usize) {
        let Some(ps) = self.client(client).map(|c| c.ps.clone()) else {
            return;
        };
        let Some(ent) = self.entities.get_mut(client) else {
            return;
        };
        if !ent.inuse {
            return;
        }
        ent.shared.s.pos.tr_base = ps.origin;
        ent.shared.s.pos.tr_delta = ps.velocity;
        ent.shared.s.apos.tr_base = ps.view_angles;
        ent.shared.s.origin = ps.origin;
        ent.shared.s.angles = ps.view_angles;
        ent.shared.s.weapon = ps.weapon;
        ent.shared.s.ground_entity_num = ps.ground_entity_num;
        ent.shared.r.current_origin = ps.origin;
        sys.link_entity(&mut ent.shared);
    }

    fn args_from(sys: &dyn GameImport, first: usize) -> String {
        (first..sys.argc()).map(|i| sys.argv(i)).collect::<Vec<_>>().join(" ")
    }

    fn say(&mut self, sys: &mut dyn GameImport, client: usize, team_only: bool) {
        let text = Self::args_from(sys, 1);
        if text.is_empty() {
            return;
        }
        let Some(speaker) = self.client(client) else {
            return;
        };
        let line = if team_only {
            format!("tchat \"({}): {}\"", speaker.netname, text)
        } else {
            format!("chat \"{}: {}\"", speaker.netname, text)
        };
        info!(client, team_only, "{}: {}", speaker.netname, text);

        if !team_only || !self.level.gametype.is_team() {
            sys.send_server_command(None, &line);
            return;
        }
        let team = speaker.session.team;
        let recipients: Vec<usize> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_ref().is_some_and(|c| c.session.team == team))
            .map(|(i, _)| i)
            .collect();
        for i in recipients {
            sys.send_server_command(Some(i), &line);
        }
    }

    fn set_team(&mut self, sys: &mut dyn GameImport, client: usize, name: &str) {
        let Some(team) = Team::parse(name) else {
            sys.send_server_command(Some(client), &format!("print \"Unknown team {name}\n\""));
            return;
        };
        let team = match team {
            Team::Red | Team::Blue if !self.level.gametype.is_team() => Team::Free,
            Team::Free if self.level.gametype.is_team() => self.pick_team(),
            t => t,
        };
        if let Some(gc) = self.clients.get_mut(client).and_then(Option::as_mut) {
            gc.session.team = team;
        }
        self.client_userinfo_changed(sys, client);
        if team == Team::Spectator {
            self.free_entity(sys, client);
        } else {
            self.respawn(sys, client);
        }
    }

    fn store_sessions(&self, sys: &mut dyn GameImport) {
        let sessions: Vec<Option<ClientSession>> = self
            .clients
            .iter()
            .map(|c| c.as_ref().map(|c| c.session.clone()))
            .collect();
        match serde_json::to_vec(&sessions) {
            Ok(data) => {
                if !sys.pd_store(SESSION_STORE, Bytes::from(data)) {
                    warn!("could not persist client sessions");
                }
            }
            Err(e) => warn!(error = %e, "serialize sessions"),
        }
    }

    fn restore_sessions(&mut self, sys: &mut dyn GameImport) {
        self.restored_sessions = sys
            .pd_load(SESSION_STORE)
            .and_then(|data| match serde_json::from_slice(&data) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "discarding stored sessions");
                    None
                }
            })
            .unwrap_or_default();
    }

    fn check_warmup(&mut self, sys: &mut dyn GameImport) {
        if self.level.warmup_time == 0 {
            return;
        }
        if self.level.warmup_time < 0 {
            if self.clients.iter().flatten().any(|c| c.connected == ClientConnection::Connected) {
                let secs = sys.cvar_int("g_warmup").max(1) as i32;
                self.level.warmup_time = self.level.time + secs * 1000;
                sys.set_configstring(CS_WARMUP, &self.level.warmup_time.to_string());
            }
            return;
        }
        if self.level.time >= self.level.warmup_time {
            self.level.warmup_time = 0;
            sys.set_configstring(CS_WARMUP, "");
            sys.send_server_command(None, "print \"Warmup over\n\"");
        }
    }
}

fn short_to_angle(v: i32) -> f32 {
    v as f32 * (360.0 / 65536.0)
}

impl GameExport for GameModule {
    fn init_game(
        &mut self,
        sys: &mut dyn GameImport,
        level_time: i32,
        random_seed: i32,
        restart: bool,
    ) -> Result<(), GameError> {
        sys.print("------- Game Initialization -------");
        sys.print(&format!("gamename: {GAME_VERSION}"));

        Self::register_cvars(sys);
        let gametype = Gametype::from_cvar(sys.cvar_int("g_gametype"));
        self.level = LevelLocals::new(level_time, random_seed, gametype, restart);
        self.entities = EntityTable::new();
        self.clients = vec![None; MAX_CLIENTS];
        self.restored_sessions.clear();
        if restart {
            self.restore_sessions(sys);
        }

        spawn_entities_from_string(self, sys, false)?;

        let stats = &self.level.stats;
        info!(
            gametype = gametype.short_name(),
            spawned = stats.spawned,
            filtered = stats.filtered,
            unknown = stats.unknown.len(),
            "level initialized"
        );
        sys.print("-----------------------------------");
        Ok(())
    }

    fn shutdown_game(&mut self, sys: &mut dyn GameImport, restart: bool) {
        sys.print("==== ShutdownGame ====");
        if restart {
            self.store_sessions(sys);
        }
    }

    fn client_connect(
        &mut self,
        sys: &mut dyn GameImport,
        client: usize,
        first_time: bool,
        is_bot: bool,
    ) -> Option<String> {
        if client >= self.clients.len() {
            return Some("Server is full.".to_string());
        }
        let userinfo = sys.get_userinfo(client);
        if !is_bot {
            let password = sys.cvar_string("g_password");
            if !password.is_empty() && !password.eq_ignore_ascii_case("none") && value_for_key(&userinfo, "password") != password {
                return Some("Invalid password".to_string());
            }
        }

        let session = self.session_for(client, first_time);
        self.clients[client] = Some(GClient {
            ps: PlayerState::default(),
            netname: String::new(),
            session,
            connected: ClientConnection::Connecting,
            is_bot,
            enter_time: 0,
        });
        self.client_userinfo_changed(sys, client);

        if first_time {
            if let Some(gc) = self.client(client) {
                let msg = format!("print \"{} connected\n\"", gc.netname);
                sys.send_server_command(None, &msg);
            }
        }
        None
    }

    fn client_begin(&mut self, sys: &mut dyn GameImport, client: usize) {
        let time = self.level.time;
        let Some(gc) = self.clients.get_mut(client).and_then(Option::as_mut) else {
            return;
        };
        gc.connected = ClientConnection::Connected;
        gc.enter_time = time;
        let spectator = gc.session.team == Team::Spectator;
        let name = gc.netname.clone();

        if !spectator {
            self.respawn(sys, client);
        }
        sys.send_server_command(None, &format!("print \"{name} entered the game\n\""));
        debug!(client, "ClientBegin");
    }

    fn client_userinfo_changed(&mut self, sys: &mut dyn GameImport, client: usize) {
        let userinfo = sys.get_userinfo(client);
        let Some(gc) = self.clients.get_mut(client).and_then(Option::as_mut) else {
            return;
        };
        let mut name = clean_name(value_for_key(&userinfo, "name"));
        if name.is_empty() {
            name = DEFAULT_NAME.to_string();
        }
        if !gc.netname.is_empty() && gc.netname != name {
            let msg = format!("print \"{} renamed to {}\n\"", gc.netname, name);
            sys.send_server_command(None, &msg);
        }
        gc.netname = name;
        let cs = format!("n\\{}\\t\\{}", gc.netname, gc.session.team as i32);
        sys.set_configstring(CS_PLAYERS + client, &cs);
    }

    fn client_disconnect(&mut self, sys: &mut dyn GameImport, client: usize) {
        let Some(gc) = self.clients.get_mut(client).and_then(Option::take) else {
            return;
        };
        sys.send_server_command(None, &format!("print \"{} disconnected\n\"", gc.netname));
        if self.entities.get(client).is_some_and(|e| e.inuse) {
            self.free_entity(sys, client);
        }
        sys.set_configstring(CS_PLAYERS + client, "");
    }

    fn client_command(&mut self, sys: &mut dyn GameImport, client: usize) {
        if self.client(client).is_none() {
            return;
        }
        let cmd = sys.argv(0);
        match cmd.to_ascii_lowercase().as_str() {
            "say" => self.say(sys, client, false),
            "say_team" => self.say(sys, client, true),
            "where" => {
                let origin = self
                    .entities
                    .get(client)
                    .map(|e| e.shared.r.current_origin)
                    .unwrap_or(Vec3::ZERO);
                sys.send_server_command(Some(client), &format!("print \"{}\n\"", origin.to_rounded_string()));
            }
            "kill" => {
                if self.entities.get(client).is_some_and(|e| e.inuse) {
                    self.respawn(sys, client);
                }
            }
            "team" => {
                if sys.argc() < 2 {
                    let team = self.client(client).map(|c| c.session.team).unwrap_or_default();
                    sys.send_server_command(Some(client), &format!("print \"Team: {team:?}\n\""));
                } else {
                    let name = sys.argv(1);
                    self.set_team(sys, client, &name);
                }
            }
            _ => sys.send_server_command(Some(client), &format!("print \"unknown cmd {cmd}\n\"")),
        }
    }

    fn client_think(&mut self, sys: &mut dyn GameImport, client: usize, cmd: &UserCmd) {
        let Some(gc) = self.clients.get_mut(client).and_then(Option::as_mut) else {
            return;
        };
        if gc.connected != ClientConnection::Connected {
            return;
        }
        let msec = (cmd.server_time - gc.ps.command_time).clamp(0, 200);
        gc.ps.command_time = cmd.server_time;
        if msec == 0 || gc.session.team == Team::Spectator {
            return;
        }

        let ps = &mut gc.ps;
        let pitch = short_to_angle(cmd.angles[PITCH] + ps.delta_angles[PITCH]);
        let yaw = short_to_angle(cmd.angles[YAW] + ps.delta_angles[YAW]);
        ps.view_angles = Vec3::new(pitch, yaw, 0.0);
        ps.weapon = i32::from(cmd.weapon);

        let (s, c) = yaw.to_radians().sin_cos();
        let forward = Vec3::new(c, s, 0.0);
        let right = Vec3::new(s, -c, 0.0);
        let scale = ps.speed as f32 / 127.0;
        ps.velocity = (forward * f32::from(cmd.forwardmove) + right * f32::from(cmd.rightmove)) * scale;
        ps.origin = ps.origin + ps.velocity * (msec as f32 / 1000.0);

        self.player_state_to_entity(sys, client);
    }

    fn run_frame(&mut self, sys: &mut dyn GameImport, level_time: i32) -> Result<(), GameError> {
        self.level.previous_time = self.level.time;
        self.level.time = level_time;

        for num in 0..self.entities.num_entities() {
            let due = match self.entities.get_mut(num) {
                Some(e) if e.inuse && e.nextthink > 0 && e.nextthink <= level_time => {
                    e.nextthink = 0;
                    e.think
                }
                _ => None,
            };
            if let Some(think) = due {
                think(self, sys, num);
            }
        }

        for client in 0..self.clients.len() {
            self.player_state_to_entity(sys, client);
        }
        self.check_warmup(sys);
        Ok(())
    }

    fn console_command(&mut self, sys: &mut dyn GameImport) -> bool {
        match sys.argv(0).to_ascii_lowercase().as_str() {
            "entitylist" => {
                for e in self.entities.iter_inuse() {
                    sys.print(&format!("{:4}: {:?} {}", e.number(), e.shared.s.e_type, e.classname));
                }
                true
            }
            "spawnstats" => {
                let stats = &self.level.stats;
                sys.print(&format!(
                    "spawned {} filtered {} unknown {}",
                    stats.spawned,
                    stats.filtered,
                    stats.unknown.join(",")
                ));
                true
            }
            _ => false,
        }
    }

    fn num_entities(&self) -> usize {
        self.entities.num_entities()
    }

    fn shared_entity(&self, num: usize) -> Option<&SharedEntity> {
        self.entities.get(num).filter(|e| e.inuse).map(|e| &e.shared)
    }

    fn player_state(&self, client: usize) -> Option<&PlayerState> {
        self.client(client).map(|c| &c.ps)
    }
}

/// Resolves `jampgame` to a fresh `GameModule`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GameModuleLoader;

impl ModuleLoader for GameModuleLoader {
    fn load(&self, name: &str) -> Result<Module, VmError> {
        if name == VmSlot::Game.module_name() {
            Ok(Module::Game(Box::new(GameModule::new())))
        } else {
            Err(VmError::NotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use jamp_shared::limits::{CS_LIGHT_STYLES, CS_LOCATIONS, ENTITYNUM_WORLD};
    use jamp_shared::parse::Tokenizer;
    use jamp_shared::persist::PersistentStore;

    use super::*;
    use crate::spawn::SpawnError;

    /// In-memory engine side for driving the module directly.
    #[derive(Default)]
    pub(crate) struct RecordingImport {
        pub tokens: Vec<String>,
        pub sub_maps: HashMap<String, Vec<String>>,
        pub stack: Vec<Vec<String>>,
        pub configstrings: HashMap<usize, String>,
        pub cvars: HashMap<String, String>,
        pub userinfo: HashMap<usize, String>,
        pub commands: Vec<(Option<usize>, String)>,
        pub args: Vec<String>,
        pub linked: Vec<i32>,
        pub prints: Vec<String>,
        pub cull: f32,
        pub store: PersistentStore,
    }

    fn tokens(text: &str) -> Vec<String> {
        let mut t = Tokenizer::new(text);
        let mut out = Vec::new();
        while let Some(tok) = t.next_token() {
            out.push(tok);
        }
        out.reverse();
        out
    }

    impl RecordingImport {
        pub fn with_entities(text: &str) -> Self {
            Self {
                tokens: tokens(text),
                ..Default::default()
            }
        }
    }

    impl GameImport for RecordingImport {
        fn print(&mut self, msg: &str) {
            self.prints.push(msg.to_string());
        }
        fn milliseconds(&self) -> i32 {
            0
        }
        fn cvar_register(&mut self, name: &str, default: &str, _flags: CvarFlags) {
            self.cvars.entry(name.to_string()).or_insert_with(|| default.to_string());
        }
        fn cvar_string(&self, name: &str) -> String {
            self.cvars.get(name).cloned().unwrap_or_default()
        }
        fn cvar_int(&self, name: &str) -> i64 {
            self.cvar_string(name).parse().unwrap_or(0)
        }
        fn cvar_set(&mut self, name: &str, value: &str) {
            self.cvars.insert(name.to_string(), value.to_string());
        }
        fn get_configstring(&self, index: usize) -> String {
            self.configstrings.get(&index).cloned().unwrap_or_default()
        }
        fn set_configstring(&mut self, index: usize, value: &str) {
            self.configstrings.insert(index, value.to_string());
        }
        fn get_serverinfo(&self) -> String {
            String::new()
        }
        fn get_userinfo(&self, client: usize) -> String {
            self.userinfo.get(&client).cloned().unwrap_or_default()
        }
        fn set_userinfo(&mut self, client: usize, info: &str) {
            self.userinfo.insert(client, info.to_string());
        }
        fn get_entity_token(&mut self) -> Option<String> {
            self.tokens.pop()
        }
        fn set_active_sub_bsp(&mut self, name: Option<&str>) -> bool {
            match name {
                Some(name) => match self.sub_maps.get(name) {
                    Some(text) => {
                        let sub = text.clone();
                        self.stack.push(std::mem::replace(&mut self.tokens, sub));
                        true
                    }
                    None => false,
                },
                None => {
                    if let Some(outer) = self.stack.pop() {
                        self.tokens = outer;
                    }
                    true
                }
            }
        }
        fn set_server_cull(&mut self, distance: f32) {
            self.cull = distance;
        }
        fn link_entity(&mut self, ent: &mut SharedEntity) {
            ent.r.linked = true;
            self.linked.push(ent.s.number);
        }
        fn unlink_entity(&mut self, ent: &mut SharedEntity) {
            ent.r.linked = false;
        }
        fn send_server_command(&mut self, client: Option<usize>, text: &str) {
            self.commands.push((client, text.to_string()));
        }
        fn drop_client(&mut self, _client: usize, _reason: &str) {}
        fn argc(&self) -> usize {
            self.args.len()
        }
        fn argv(&self, n: usize) -> String {
            self.args.get(n).cloned().unwrap_or_default()
        }
        fn pd_store(&mut self, name: &str, data: Bytes) -> bool {
            self.store.store(name, data).is_ok()
        }
        fn pd_load(&mut self, name: &str) -> Option<Bytes> {
            self.store.load(name)
        }
    }

    const WORLD: &str = r#"{ "classname" "worldspawn" "music" "music/mp/duel" }"#;

    fn init(text: &str) -> (GameModule, RecordingImport) {
        let mut sys = RecordingImport::with_entities(text);
        let mut game = GameModule::new();
        game.init_game(&mut sys, 0, 1234, false).unwrap();
        (game, sys)
    }

    #[test]
    fn null_entities_spawn_and_unknown_classes_are_reported() {
        let text = format!(
            r#"{WORLD}
            {{ "classname" "info_null" "origin" "0 0 0" }}
            {{ "classname" "nonexistent_class" }}"#
        );
        let (game, sys) = init(&text);
        assert_eq!(game.level.stats.spawned, 1);
        assert_eq!(game.level.stats.unknown, vec!["nonexistent_class".to_string()]);
        assert_eq!(game.entities.iter_inuse().count(), 0);
        assert_eq!(sys.get_configstring(jamp_shared::limits::CS_MUSIC), "music/mp/duel");
        assert_eq!(sys.cull, 6000.0);
    }

    #[test]
    fn first_entity_must_be_worldspawn() {
        let mut sys = RecordingImport::with_entities(r#"{ "classname" "info_null" }"#);
        let mut game = GameModule::new();
        let err = game.init_game(&mut sys, 0, 0, false).unwrap_err();
        assert_eq!(err, GameError::from(SpawnError::NotWorldspawn));
    }

    #[test]
    fn empty_entity_text_is_fatal() {
        let mut sys = RecordingImport::default();
        let err = GameModule::new().init_game(&mut sys, 0, 0, false).unwrap_err();
        assert_eq!(err.to_string(), "SpawnEntities: no entities");
    }

    #[test]
    fn broken_blocks_are_fatal() {
        let mut sys = RecordingImport::with_entities(r#"{ "classname" "worldspawn" } "classname""#);
        let err = GameModule::new().init_game(&mut sys, 0, 0, false).unwrap_err();
        assert_eq!(err.to_string(), "G_ParseSpawnVars: found classname when expecting {");

        let mut sys = RecordingImport::with_entities(r#"{ "classname" "worldspawn" } { "origin" "#);
        let err = GameModule::new().init_game(&mut sys, 0, 0, false).unwrap_err();
        assert_eq!(err.to_string(), "G_ParseSpawnVars: EOF without closing brace");
    }

    #[test]
    fn gametype_filters() {
        let text = format!(
            r#"{WORLD}
            {{ "classname" "info_notnull" "notfree" "1" }}
            {{ "classname" "info_notnull" "gametype" "ctf cty" }}
            {{ "classname" "info_notnull" "gametype" "ffa duel" }}"#
        );
        let (game, _) = init(&text);
        assert_eq!(game.level.stats.filtered, 2);
        assert_eq!(game.find_notnull().len(), 1);
    }

    impl GameModule {
        fn find_notnull(&self) -> Vec<usize> {
            self.entities.find_by_classname("info_notnull")
        }
    }

    #[test]
    fn light_styles_and_locations() {
        let text = format!(
            r#"{{ "classname" "worldspawn" "ls_1r" "az" "ls_1g" "az" "ls_1b" "az" }}
            {{ "classname" "target_location" "message" "Courtyard" }}"#
        );
        let (_, sys) = init(&text);
        assert_eq!(sys.get_configstring(CS_LIGHT_STYLES), "z");
        assert_eq!(sys.get_configstring(CS_LIGHT_STYLES + 3), "az");
        assert_eq!(sys.get_configstring(CS_LIGHT_STYLES + 13 * 3 + 1), "zyxwvutsrqmlkjihgfedcba");
        assert_eq!(sys.get_configstring(CS_LOCATIONS), "unknown");
        assert_eq!(sys.get_configstring(CS_LOCATIONS + 1), "Courtyard");

        let mut sys = RecordingImport::with_entities(r#"{ "classname" "worldspawn" "ls_2r" "a" }"#);
        let err = GameModule::new().init_game(&mut sys, 0, 0, false).unwrap_err();
        assert!(err.to_string().starts_with("Style 2 has inconsistent lengths"));

        let mut sys = RecordingImport::with_entities(
            r#"{ "classname" "worldspawn" "ls_1r" "az" "ls_1g" "a" "ls_1b" "azz" }"#,
        );
        let err = GameModule::new().init_game(&mut sys, 0, 0, false).unwrap_err();
        assert!(err.to_string().starts_with("Style 1 has inconsistent lengths"));
    }

    #[test]
    fn items_link_after_their_first_think() {
        let text = format!(r#"{WORLD} {{ "classname" "weapon_blaster" "origin" "64 0 0" }}"#);
        let (mut game, mut sys) = init(&text);
        let num = game.entities.find_by_classname("weapon_blaster")[0];
        assert!(!game.entities.get(num).unwrap().shared.r.linked);

        game.run_frame(&mut sys, 100).unwrap();
        assert!(!game.entities.get(num).unwrap().shared.r.linked);
        game.run_frame(&mut sys, 200).unwrap();
        let e = game.entities.get(num).unwrap();
        assert!(e.shared.r.linked);
        assert_eq!(e.shared.r.current_origin, Vec3::new(64.0, 0.0, 0.0));
    }

    #[test]
    fn team_items_need_a_flag_gametype() {
        let text = format!(r#"{WORLD} {{ "classname" "team_CTF_redflag" }}"#);
        let (game, _) = init(&text);
        assert!(game.entities.find_by_classname("team_CTF_redflag").is_empty());
    }

    #[test]
    fn misc_bsp_instances_sub_map_entities() {
        let mut sys = RecordingImport::with_entities(&format!(
            r#"{WORLD}
            {{ "classname" "misc_bsp" "bspmodel" "ctf_base" "origin" "1000 0 0" "angles" "0 90 0" "teamfilter" "red" }}
            {{ "classname" "info_notnull" "targetname" "outer" }}"#
        ));
        sys.sub_maps.insert(
            "ctf_base".to_string(),
            tokens(
                r#"{ "classname" "worldspawn" }
                { "classname" "info_notnull" "origin" "100 0 0" "targetname" "door" }
                { "classname" "gametype_item" "targetname" "base_flag" }"#,
            ),
        );
        sys.cvars.insert("g_gametype".to_string(), "6".to_string());
        let mut game = GameModule::new();
        game.init_game(&mut sys, 0, 0, false).unwrap();

        let notnull = game.find_notnull();
        assert_eq!(notnull.len(), 2);
        let inner = game.entities.get(notnull[0]).unwrap();
        assert_eq!(inner.targetname.as_deref(), Some("1-door"));
        assert_eq!(inner.shared.s.origin.to_rounded_string(), "1000 100 0");
        let outer = game.entities.get(notnull[1]).unwrap();
        assert_eq!(outer.targetname.as_deref(), Some("outer"));

        assert_eq!(game.entities.find_by_classname("team_CTF_redflag").len(), 1);
        assert!(game.level.bsp_adjust.is_none());
        assert_eq!(game.level.bsp_instance_depth, 0);
        assert!(sys.stack.is_empty());
    }

    #[test]
    fn connect_begin_and_chat() {
        let text = format!(r#"{WORLD} {{ "classname" "info_player_start" "origin" "0 0 24" }}"#);
        let (mut game, mut sys) = init(&text);
        sys.userinfo.insert(0, "\\name\\^1Kyle\\rate\\25000".to_string());

        assert_eq!(game.client_connect(&mut sys, 0, true, false), None);
        assert_eq!(sys.get_configstring(CS_PLAYERS), "n\\Kyle\\t\\0");
        game.client_begin(&mut sys, 0);
        assert_eq!(game.entities.get(0).unwrap().shared.r.current_origin, Vec3::new(0.0, 0.0, 33.0));

        sys.commands.clear();
        sys.args = vec!["say".into(), "hello".into(), "there".into()];
        game.client_command(&mut sys, 0);
        assert_eq!(sys.commands, vec![(None, "chat \"Kyle: hello there\"".to_string())]);

        sys.commands.clear();
        sys.args = vec!["dance".into()];
        game.client_command(&mut sys, 0);
        assert_eq!(sys.commands, vec![(Some(0), "print \"unknown cmd dance\n\"".to_string())]);

        game.client_disconnect(&mut sys, 0);
        assert_eq!(sys.get_configstring(CS_PLAYERS), "");
        assert!(game.player_state(0).is_none());
        assert!(game.shared_entity(0).is_none());
    }

    #[test]
    fn password_is_checked() {
        let (mut game, mut sys) = init(WORLD);
        sys.cvars.insert("g_password".to_string(), "secret".to_string());
        sys.userinfo.insert(1, "\\name\\Jan\\password\\wrong".to_string());
        assert_eq!(game.client_connect(&mut sys, 1, true, false), Some("Invalid password".to_string()));
        assert_eq!(game.client_connect(&mut sys, 1, true, true), None);
    }

    #[test]
    fn movement_follows_usercmds() {
        let (mut game, mut sys) = init(WORLD);
        game.client_connect(&mut sys, 0, true, false);
        game.client_begin(&mut sys, 0);
        let cmd = UserCmd {
            server_time: 100,
            forwardmove: 127,
            ..Default::default()
        };
        game.client_think(&mut sys, 0, &cmd);
        let ps = game.player_state(0).unwrap();
        assert_eq!(ps.command_time, 100);
        assert!((ps.origin.x - 25.0).abs() < 0.01);
        assert_eq!(game.shared_entity(0).unwrap().s.pos.tr_base, ps.origin);
    }

    #[test]
    fn sessions_survive_restart() {
        let (mut game, mut sys) = init(WORLD);
        sys.cvars.insert("g_gametype".to_string(), "5".to_string());
        game.client_connect(&mut sys, 2, true, false);
        game.clients[2].as_mut().unwrap().session.team = Team::Blue;
        game.shutdown_game(&mut sys, true);

        sys.tokens = tokens(WORLD);
        let mut next = GameModule::new();
        next.init_game(&mut sys, 5000, 0, true).unwrap();
        next.client_connect(&mut sys, 2, false, false);
        assert_eq!(next.client(2).unwrap().session.team, Team::Blue);
        assert!(sys.pd_load(SESSION_STORE).is_none());
    }

    #[test]
    fn world_entity_is_reserved() {
        let (game, _) = init(WORLD);
        assert_eq!(game.entities.get(ENTITYNUM_WORLD).unwrap().classname, "worldspawn");
    }

    #[test]
    fn loader_only_knows_jampgame() {
        assert!(matches!(GameModuleLoader.load("jampgame"), Ok(Module::Game(_))));
        assert!(matches!(GameModuleLoader.load("cgame"), Err(VmError::NotFound(_))));
    }
}
