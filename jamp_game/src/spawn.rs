//! Entity spawn pipeline.
//!
//! Entity text is a sequence of brace-delimited blocks of `"key" "value"`
//! pairs pulled token by token through `GameImport::get_entity_token`. Each
//! block is collected into `SpawnVars`, applied to a fresh entity through the
//! field table, filtered by gametype, and handed to an item or classname
//! constructor. The first block is always `worldspawn`, which configures the
//! level instead of becoming an entity.
//!
//! Errors come in two strengths. A bad value or an unknown classname is
//! logged and the pipeline moves on. Broken structure or exhausted tables
//! produce a `SpawnError` and the level does not load.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use jamp_shared::fixed::{CapacityError, FixedVec};
use jamp_shared::game_api::{GameError, GameImport};
use jamp_shared::limits::{
    CS_GAME_VERSION, CS_GLOBAL_AMBIENT_SET, CS_LEVEL_START_TIME, CS_LIGHT_STYLES, CS_LOCATIONS, CS_MESSAGE, CS_MOTD,
    CS_MUSIC, CS_WARMUP, LS_NUM_STYLES, LS_STYLES_START, MAX_SPAWN_VARS, MAX_SPAWN_VARS_CHARS,
};
use jamp_shared::math::{angle_mod, round_whole, Vec3, YAW};
use jamp_shared::parse::{atof, atoi};

use crate::entity::{GEntity, MAX_PARMS};
use crate::items::{find_item, spawn_item};
use crate::level::{Gametype, SubBspAdjust};
use crate::module::GameModule;

pub const GAME_VERSION: &str = "basejka-1";

/// Structural problems that stop a level from loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("G_ParseSpawnVars: found {0} when expecting {{")]
    ExpectedOpenBrace(String),
    #[error("G_ParseSpawnVars: EOF without closing brace")]
    MissingCloseBrace,
    #[error("G_ParseSpawnVars: closing brace without data")]
    BraceWithoutData,
    #[error("G_ParseSpawnVars: MAX_SPAWN_VARS")]
    TooManyVars,
    #[error("G_AddSpawnVarToken: MAX_SPAWN_VARS_CHARS")]
    TooManyChars,
    #[error("SpawnEntities: no entities")]
    NoEntities,
    #[error("SP_worldspawn: The first entity isn't 'worldspawn'")]
    NotWorldspawn,
    #[error("Style {style} has inconsistent lengths: R {red}, G {green}, B {blue}")]
    LightStyleLengths {
        style: usize,
        red: usize,
        green: usize,
        blue: usize,
    },
    #[error("G_Spawn: no free entities")]
    NoFreeEntities,
}

impl From<SpawnError> for GameError {
    fn from(e: SpawnError) -> Self {
        GameError::Fatal(e.to_string())
    }
}

impl From<CapacityError> for SpawnError {
    fn from(_: CapacityError) -> Self {
        SpawnError::NoFreeEntities
    }
}

/// Key/value pairs of the entity block being spawned.
///
/// Storage is charged against `MAX_SPAWN_VARS_CHARS` on every write,
/// overwrites included, and keys are capped at `MAX_SPAWN_VARS`. Writing an
/// existing key (case-insensitive) replaces its value.
#[derive(Debug)]
pub struct SpawnVars {
    vars: FixedVec<(String, String)>,
    chars: usize,
}

impl Default for SpawnVars {
    fn default() -> Self {
        Self {
            vars: FixedVec::new("MAX_SPAWN_VARS", MAX_SPAWN_VARS),
            chars: 0,
        }
    }
}

impl SpawnVars {
    pub fn clear(&mut self) {
        self.vars.clear();
        self.chars = 0;
    }

    fn charge(&mut self, s: &str) -> Result<(), SpawnError> {
        if self.chars + s.len() + 1 > MAX_SPAWN_VARS_CHARS {
            return Err(SpawnError::TooManyChars);
        }
        self.chars += s.len() + 1;
        Ok(())
    }

    /// Adds or overwrites `key`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SpawnError> {
        if let Some(i) = self.vars.iter().position(|(k, _)| k.eq_ignore_ascii_case(key)) {
            self.charge(value)?;
            if let Some(slot) = self.vars.get_mut(i) {
                slot.1 = value.to_string();
            }
            return Ok(());
        }
        if self.vars.remaining() == 0 {
            return Err(SpawnError::TooManyVars);
        }
        self.charge(key)?;
        self.charge(value)?;
        self.vars
            .try_push((key.to_string(), value.to_string()))
            .map_err(|_| SpawnError::TooManyVars)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `(present, value)`, falling back to `default`.
    pub fn string<'a>(&'a self, key: &str, default: &'a str) -> (bool, &'a str) {
        match self.get(key) {
            Some(v) => (true, v),
            None => (false, default),
        }
    }

    pub fn float(&self, key: &str, default: &str) -> (bool, f32) {
        let (present, s) = self.string(key, default);
        (present, atof(s))
    }

    pub fn int(&self, key: &str, default: &str) -> (bool, i32) {
        let (present, s) = self.string(key, default);
        (present, atoi(s))
    }

    /// Malformed values log and yield the zero vector.
    pub fn vector(&self, key: &str, default: &str) -> (bool, Vec3) {
        let (present, s) = self.string(key, default);
        match Vec3::parse(s) {
            Some(v) => (present, v),
            None => {
                warn!(key, default, "G_SpawnVector: Failed sscanf on {}", s);
                (false, Vec3::ZERO)
            }
        }
    }

    /// `true`/`yes`/`1` and `false`/`no`/`0`; anything else is false.
    pub fn boolean(&self, key: &str, default: &str) -> (bool, bool) {
        let (present, s) = self.string(key, default);
        let v = ["true", "yes", "1"].iter().any(|t| s.eq_ignore_ascii_case(t));
        (present, v)
    }
}

/// How a key is written into an entity.
#[derive(Clone, Copy)]
pub enum Field {
    Int(fn(&mut GEntity, i32)),
    Float(fn(&mut GEntity, f32)),
    Str(fn(&mut GEntity, String)),
    Vector(fn(&mut GEntity, Vec3)),
    /// A single yaw value stored as `(0, yaw, 0)`.
    AngleHack(fn(&mut GEntity, Vec3)),
    /// `parm1`..`parm16`, zero-based.
    Parm(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
    Str,
    Vector,
    AngleHack,
    Parm(usize),
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Int(_) => FieldKind::Int,
            Field::Float(_) => FieldKind::Float,
            Field::Str(_) => FieldKind::Str,
            Field::Vector(_) => FieldKind::Vector,
            Field::AngleHack(_) => FieldKind::AngleHack,
            Field::Parm(i) => FieldKind::Parm(*i),
        }
    }
}

/// Case-insensitive map of spawn keys to entity fields.
pub struct FieldTable {
    fields: HashMap<String, Field>,
}

impl Default for FieldTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldTable {
    pub fn new() -> Self {
        let mut t = Self { fields: HashMap::new() };

        t.add("alliedteam", Field::Int(|e, v| e.allied_team = v));
        t.add("angle", Field::AngleHack(|e, v| e.shared.s.angles = v));
        t.add("angles", Field::Vector(|e, v| e.shared.s.angles = v));
        t.add("chunksize", Field::Float(|e, v| e.mass = v));
        t.add("classname", Field::Str(|e, v| e.classname = v));
        t.add("closetarget", Field::Str(|e, v| e.closetarget = Some(v)));
        t.add("count", Field::Int(|e, v| e.count = v));
        t.add("delay", Field::Int(|e, v| e.delay = v));
        t.add("delayscripttime", Field::Int(|e, v| e.delay_script_time = v));
        t.add("dmg", Field::Int(|e, v| e.damage = v));
        t.add("fullname", Field::Str(|e, v| e.fullname = Some(v)));
        t.add("goaltarget", Field::Str(|e, v| e.goaltarget = Some(v)));
        t.add("healingclass", Field::Str(|e, v| e.healingclass = Some(v)));
        t.add("healingrate", Field::Int(|e, v| e.healingrate = v));
        t.add("healingsound", Field::Str(|e, v| e.healingsound = Some(v)));
        t.add("health", Field::Int(|e, v| e.health = v));
        t.add("linear", Field::Int(|e, v| e.alt_fire = v));
        t.add("message", Field::Str(|e, v| e.message = Some(v)));
        t.add("model", Field::Str(|e, v| e.model = Some(v)));
        t.add("model2", Field::Str(|e, v| e.model2 = Some(v)));
        t.add("numchunks", Field::Float(|e, v| e.radius = v));
        t.add("opentarget", Field::Str(|e, v| e.opentarget = Some(v)));
        t.add("origin", Field::Vector(|e, v| e.shared.s.origin = v));
        t.add("ownername", Field::Str(|e, v| e.ownername = Some(v)));
        t.add("paintarget", Field::Str(|e, v| e.paintarget = Some(v)));
        t.add("radius", Field::Float(|e, v| e.radius = v));
        t.add("random", Field::Float(|e, v| e.random = v));
        t.add("roffname", Field::Str(|e, v| e.roffname = Some(v)));
        t.add("rofftarget", Field::Str(|e, v| e.rofftarget = Some(v)));
        t.add("script_targetname", Field::Str(|e, v| e.script_targetname = Some(v)));
        t.add("soundset", Field::Str(|e, v| e.soundset = Some(v)));
        t.add("spawnflags", Field::Int(|e, v| e.spawnflags = v));
        t.add("speed", Field::Float(|e, v| e.speed = v));
        t.add("target", Field::Str(|e, v| e.target = Some(v)));
        t.add("target2", Field::Str(|e, v| e.target2 = Some(v)));
        t.add("target3", Field::Str(|e, v| e.target3 = Some(v)));
        t.add("target4", Field::Str(|e, v| e.target4 = Some(v)));
        t.add("target5", Field::Str(|e, v| e.target5 = Some(v)));
        t.add("target6", Field::Str(|e, v| e.target6 = Some(v)));
        t.add("targetname", Field::Str(|e, v| e.targetname = Some(v)));
        t.add("targetshadername", Field::Str(|e, v| e.target_shader_name = Some(v)));
        t.add("targetshadernewname", Field::Str(|e, v| e.target_shader_new_name = Some(v)));
        t.add("team", Field::Str(|e, v| e.team = Some(v)));
        t.add("teamnodmg", Field::Int(|e, v| e.teamnodmg = v));
        t.add("teamowner", Field::Int(|e, v| e.shared.s.teamowner = v));
        t.add("teamuser", Field::Int(|e, v| e.allied_team = v));
        t.add("wait", Field::Float(|e, v| e.wait = v));

        t.add("angerscript", Field::Str(|e, v| set_behavior(e, "anger", v)));
        t.add("attackscript", Field::Str(|e, v| set_behavior(e, "attack", v)));
        t.add("awakescript", Field::Str(|e, v| set_behavior(e, "awake", v)));
        t.add("blockedscript", Field::Str(|e, v| set_behavior(e, "blocked", v)));
        t.add("deathscript", Field::Str(|e, v| set_behavior(e, "death", v)));
        t.add("delayscript", Field::Str(|e, v| set_behavior(e, "delayed", v)));
        t.add("ffdeathscript", Field::Str(|e, v| set_behavior(e, "ffdeath", v)));
        t.add("ffirescript", Field::Str(|e, v| set_behavior(e, "ffire", v)));
        t.add("fleescript", Field::Str(|e, v| set_behavior(e, "flee", v)));
        t.add("lostenemyscript", Field::Str(|e, v| set_behavior(e, "lostenemy", v)));
        t.add("mindtrickscript", Field::Str(|e, v| set_behavior(e, "mindtrick", v)));
        t.add("painscript", Field::Str(|e, v| set_behavior(e, "pain", v)));
        t.add("spawnscript", Field::Str(|e, v| set_behavior(e, "spawn", v)));
        t.add("usescript", Field::Str(|e, v| set_behavior(e, "use", v)));
        t.add("victoryscript", Field::Str(|e, v| set_behavior(e, "victory", v)));

        for i in 0..MAX_PARMS {
            t.add(&format!("parm{}", i + 1), Field::Parm(i));
        }
        t
    }

    fn add(&mut self, name: &str, field: Field) {
        self.fields.insert(name.to_ascii_lowercase(), field);
    }

    pub fn get(&self, key: &str) -> Option<Field> {
        self.fields.get(&key.to_ascii_lowercase()).copied()
    }

    /// `G_ParseField`: writes one key into `ent`. Unknown keys are ignored
    /// and malformed vectors become the zero vector.
    pub fn parse_field(&self, ent: &mut GEntity, key: &str, value: &str) {
        let Some(field) = self.get(key) else {
            return;
        };
        match field {
            Field::Str(set) => set(ent, new_string(value)),
            Field::Vector(set) => match Vec3::parse(value) {
                Some(v) => set(ent, v),
                None => {
                    warn!(key, value, "G_ParseField: Failed sscanf on F_VECTOR");
                    set(ent, Vec3::ZERO);
                }
            },
            Field::Int(set) => set(ent, atoi(value)),
            Field::Float(set) => set(ent, atof(value)),
            Field::AngleHack(set) => set(ent, Vec3::new(0.0, atof(value), 0.0)),
            Field::Parm(i) => ent.parms[i] = Some(value.to_string()),
        }
    }
}

fn set_behavior(e: &mut GEntity, behavior: &'static str, script: String) {
    e.behavior_set.insert(behavior, script);
}

/// Copies `s`, turning the two characters `\n` into a newline.
pub fn new_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'n') {
            chars.next();
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}

/// Constructor for one classname.
pub trait SpawnHandler: Send + Sync {
    fn invoke(&self, game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> Result<(), SpawnError>;
}

impl<F> SpawnHandler for F
where
    F: Fn(&mut GameModule, &mut dyn GameImport, usize) -> Result<(), SpawnError> + Send + Sync,
{
    fn invoke(&self, game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> Result<(), SpawnError> {
        self(game, sys, num)
    }
}

/// Case-insensitive classname → constructor map, built once.
#[derive(Default, Clone)]
pub struct SpawnRegistry {
    handlers: HashMap<String, Arc<dyn SpawnHandler>>,
}

impl SpawnRegistry {
    pub fn register(&mut self, classname: &str, handler: impl SpawnHandler + 'static) {
        self.handlers.insert(classname.to_ascii_lowercase(), Arc::new(handler));
    }

    pub fn get(&self, classname: &str) -> Option<Arc<dyn SpawnHandler>> {
        self.handlers.get(&classname.to_ascii_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

const NOVALUE: &str = "novalue";

/// Rewrites a sub-map entity's placement keys into the parent map's frame and
/// namespaces its target names.
pub fn handle_entity_adjustment(vars: &mut SpawnVars, adjust: &SubBspAdjust) -> Result<(), SpawnError> {
    let origin = match vars.get("origin") {
        Some(s) => Vec3::parse(s).unwrap_or_else(|| {
            warn!(value = s, "HandleEntityAdjustment: failed sscanf on 'origin'");
            Vec3::ZERO
        }),
        None => Vec3::ZERO,
    };
    let new_origin = origin.rotate_z(adjust.rotation) + adjust.origin;
    vars.set("origin", &new_origin.to_rounded_string())?;

    if let Some(s) = vars.get("angles").map(str::to_string) {
        let mut angles = Vec3::parse(&s).unwrap_or_else(|| {
            warn!(value = %s, "HandleEntityAdjustment: failed sscanf on 'angles'");
            Vec3::ZERO
        });
        angles.set(YAW, angle_mod(angles.get(YAW) + adjust.rotation));
        vars.set("angles", &angles.to_rounded_string())?;
    } else {
        let yaw = vars.get("angle").map(atof).unwrap_or(0.0);
        vars.set("angle", &round_whole(angle_mod(yaw + adjust.rotation)))?;
    }

    let mut direction = match vars.get("direction") {
        Some(s) => Vec3::parse(s).unwrap_or_else(|| {
            warn!(value = s, "HandleEntityAdjustment: failed sscanf on 'direction'");
            Vec3::ZERO
        }),
        None => Vec3::ZERO,
    };
    direction.set(YAW, angle_mod(direction.get(YAW) + adjust.rotation));
    vars.set("direction", &direction.to_rounded_string())?;

    vars.set("BSPInstanceID", &adjust.target_prefix)?;

    for key in ["targetname", "target", "killtarget", "brushparent", "brushchild", "enemy", "ICARUSname"] {
        let (present, value) = vars.string(key, NOVALUE);
        if present && !value.eq_ignore_ascii_case(NOVALUE) {
            let prefixed = format!("{}{}", adjust.target_prefix, value);
            vars.set(key, &prefixed)?;
        }
    }
    Ok(())
}

/// `G_ParseSpawnVars`: reads the next `{ ... }` block into the level's spawn
/// vars. Returns false at the end of the entity text.
pub fn parse_spawn_vars(game: &mut GameModule, sys: &mut dyn GameImport, in_sub_bsp: bool) -> Result<bool, SpawnError> {
    let vars = &mut game.level.spawn_vars;
    vars.clear();

    let Some(token) = sys.get_entity_token() else {
        return Ok(false);
    };
    if !token.starts_with('{') {
        return Err(SpawnError::ExpectedOpenBrace(token));
    }

    loop {
        let key = sys.get_entity_token().ok_or(SpawnError::MissingCloseBrace)?;
        if key.starts_with('}') {
            break;
        }
        let value = sys.get_entity_token().ok_or(SpawnError::MissingCloseBrace)?;
        if value.starts_with('}') {
            return Err(SpawnError::BraceWithoutData);
        }
        vars.set(&key, &value)?;
    }

    if in_sub_bsp {
        if let Some(adjust) = &game.level.bsp_adjust {
            handle_entity_adjustment(&mut game.level.spawn_vars, adjust)?;
        }
    }
    Ok(true)
}

/// `G_SpawnGEntityFromSpawnVars`.
pub fn spawn_gentity_from_spawn_vars(game: &mut GameModule, sys: &mut dyn GameImport) -> Result<(), SpawnError> {
    let num = game.entities.spawn(game.level.time, game.level.start_time)?;

    if let Some(ent) = game.entities.get_mut(num) {
        for (key, value) in game.level.spawn_vars.iter() {
            game.fields.parse_field(ent, key, value);
        }
    }

    let vars = &game.level.spawn_vars;
    let excluded_by_mode = if game.level.gametype.is_team() {
        vars.int("notteam", "0").1 != 0
    } else {
        vars.int("notfree", "0").1 != 0
    };
    let excluded_by_list = match vars.get("gametype") {
        Some(list) => !list.contains(game.level.gametype.short_name()),
        None => false,
    };
    if excluded_by_mode || excluded_by_list {
        game.free_entity(sys, num);
        game.level.stats.filtered += 1;
        return Ok(());
    }

    if let Some(ent) = game.entities.get_mut(num) {
        let origin = ent.shared.s.origin;
        ent.shared.s.pos.tr_base = origin;
        ent.shared.r.current_origin = origin;
    }

    if call_spawn(game, sys, num)? {
        game.level.stats.spawned += 1;
    } else {
        game.free_entity(sys, num);
    }
    Ok(())
}

/// `G_CallSpawn`: items first, then classname constructors. Returns false
/// when neither knows the classname.
pub fn call_spawn(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> Result<bool, SpawnError> {
    let classname = match game.entities.get(num) {
        Some(e) => e.classname.clone(),
        None => return Ok(false),
    };
    if classname.is_empty() || classname == "noclass" {
        warn!(num, "G_CallSpawn: NULL classname");
        game.level.stats.unknown.push(String::new());
        return Ok(false);
    }

    if let Some(item) = find_item(&classname) {
        spawn_item(game, num, item);
        return Ok(true);
    }

    if let Some(handler) = game.spawns.get(&classname) {
        if let Some(sound) = game.entities.get(num).and_then(|e| e.healingsound.clone()) {
            game.sound_index(sys, &sound);
        }
        handler.invoke(game, sys, num)?;
        return Ok(true);
    }

    warn!("{} doesn't have a spawn function", classname);
    game.level.stats.unknown.push(classname);
    Ok(false)
}

/// `G_SpawnEntitiesFromString`: spawns every entity of the active entity
/// text. Sub-maps skip their worldspawn and run their entities through
/// `handle_entity_adjustment`.
pub fn spawn_entities_from_string(game: &mut GameModule, sys: &mut dyn GameImport, in_sub_bsp: bool) -> Result<(), SpawnError> {
    game.level.spawning = true;

    if !parse_spawn_vars(game, sys, false)? {
        return Err(SpawnError::NoEntities);
    }
    if !in_sub_bsp {
        worldspawn(game, sys)?;
    }

    while parse_spawn_vars(game, sys, in_sub_bsp)? {
        spawn_gentity_from_spawn_vars(game, sys)?;
    }

    if let Some(script) = game.entities.world().behavior_set.get("spawn") {
        debug!(script = %script, "world spawn script");
    }

    if !in_sub_bsp {
        game.level.spawning = false;
    }

    link_locations(game, sys);
    precache_soundsets(game, sys);
    Ok(())
}

static DEFAULT_STYLES: [[&str; 3]; LS_NUM_STYLES] = {
    const OFF: [&str; 3] = ["", "", ""];
    const fn same(s: &'static str) -> [&'static str; 3] {
        [s, s, s]
    }
    [
        same("z"),
        same("mmnmmommommnonmmonqnmmo"),
        same("abcdefghijklmnopqrstuvwxyzyxwvutsrqponmlkjihgfedcb"),
        same("mmmmmaaaaammmmmaaaaaabcdefgabcdefg"),
        same("mamamamamama"),
        same("jklmnopqrstuvwxyzyxwvutsrqponmlkj"),
        same("nmonqnmomnmomomno"),
        same("mmmaaaabcdefgmmmmaaaammmaamm"),
        same("mmmaaammmaaammmabcdefaaaammmmabcdefmmmaaaa"),
        same("aaaaaaaazzzzzzzz"),
        same("mmamammmmammamamaaamammma"),
        same("abcdefghijklmnopqrrqponmlkjihgfedcba"),
        same("mkigegik"),
        [
            "abcdefghijklmqrstuvwxyz",
            "zyxwvutsrqmlkjihgfedcba",
            "aammbbzzccllcckkffyyggp",
        ],
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
        OFF,
    ]
};

/// `SP_worldspawn`: level-wide settings from the first entity block.
pub fn worldspawn(game: &mut GameModule, sys: &mut dyn GameImport) -> Result<(), SpawnError> {
    let vars = &game.level.spawn_vars;

    let (_, cull) = vars.float("distanceCull", "6000.0");
    game.level.cull_distance = cull;
    sys.set_server_cull(cull);

    if !vars.string("classname", "").1.eq_ignore_ascii_case("worldspawn") {
        return Err(SpawnError::NotWorldspawn);
    }

    // Only the spawn script may be set on the world itself.
    if let Some(script) = vars.get("spawnscript") {
        let script = script.to_string();
        game.fields.parse_field(game.entities.world_mut(), "spawnscript", &script);
    }

    let vars = &game.level.spawn_vars;
    sys.set_configstring(CS_GAME_VERSION, GAME_VERSION);
    sys.set_configstring(CS_LEVEL_START_TIME, &game.level.start_time.to_string());
    sys.set_configstring(CS_MUSIC, vars.string("music", "").1);
    sys.set_configstring(CS_MESSAGE, vars.string("message", "").1);
    let motd = sys.cvar_string("g_motd");
    sys.set_configstring(CS_MOTD, &motd);
    sys.cvar_set("g_gravity", vars.string("gravity", "800").1);
    sys.set_configstring(CS_GLOBAL_AMBIENT_SET, vars.string("soundSet", "default").1);

    game.entities.init_reserved();

    sys.set_configstring(CS_WARMUP, "");
    if sys.cvar_int("g_restarted") != 0 {
        sys.cvar_set("g_restarted", "0");
        game.level.warmup_time = 0;
    } else if sys.cvar_int("g_doWarmup") != 0 && !matches!(game.level.gametype, Gametype::Duel | Gametype::PowerDuel) {
        game.level.warmup_time = -1;
        sys.set_configstring(CS_WARMUP, "-1");
        sys.print("Warmup:");
    }

    let base = CS_LIGHT_STYLES + LS_STYLES_START * 3;
    for (channel, pattern) in DEFAULT_STYLES[0].iter().enumerate() {
        sys.set_configstring(base + channel, pattern);
    }
    let vars = &game.level.spawn_vars;
    for style in 1..LS_NUM_STYLES {
        let mut lengths = [0usize; 3];
        for (channel, suffix) in ['r', 'g', 'b'].into_iter().enumerate() {
            let key = format!("ls_{style}{suffix}");
            let (_, text) = vars.string(&key, DEFAULT_STYLES[style][channel]);
            lengths[channel] = text.len();
            sys.set_configstring(CS_LIGHT_STYLES + (style + LS_STYLES_START) * 3 + channel, text);
        }
        if lengths[0] != lengths[1] || lengths[1] != lengths[2] {
            return Err(SpawnError::LightStyleLengths {
                style,
                red: lengths[0],
                green: lengths[1],
                blue: lengths[2],
            });
        }
    }
    Ok(())
}

/// Publishes `target_location` messages once per level.
fn link_locations(game: &mut GameModule, sys: &mut dyn GameImport) {
    if game.level.locations_linked || game.level.locations.is_empty() {
        return;
    }
    game.level.locations_linked = true;
    sys.set_configstring(CS_LOCATIONS, "unknown");
    for (i, message) in game.level.locations.iter().enumerate() {
        sys.set_configstring(CS_LOCATIONS + i + 1, message);
    }
}

fn precache_soundsets(game: &mut GameModule, sys: &mut dyn GameImport) {
    let sets: Vec<(usize, String)> = game
        .entities
        .iter_inuse()
        .filter_map(|e| e.soundset.as_ref().filter(|s| !s.is_empty()).map(|s| (e.number(), s.clone())))
        .collect();
    for (num, set) in sets {
        let index = game.soundset_index(sys, &set);
        if let Some(e) = game.entities.get_mut(num) {
            e.shared.s.sound_set_index = index;
        }
    }
}
