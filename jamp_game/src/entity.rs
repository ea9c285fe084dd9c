//! Game entities and the entity table.

use std::collections::HashMap;

use jamp_shared::entity_state::{EntityState, SharedEntity};
use jamp_shared::fixed::CapacityError;
use jamp_shared::limits::{ENTITYNUM_MAX_NORMAL, ENTITYNUM_NONE, ENTITYNUM_WORLD, MAX_CLIENTS, MAX_GENTITIES};
use jamp_shared::math::Vec3;

use crate::module::GameModule;
use jamp_shared::game_api::GameImport;

/// Scheduled per-entity callback.
pub type ThinkFn = fn(&mut GameModule, &mut dyn GameImport, usize);

pub const CONTENTS_TRIGGER: i32 = 0x400;

/// Number of `parmN` slots on an entity.
pub const MAX_PARMS: usize = 16;

/// A game object. `shared` is the part the engine reads.
#[derive(Debug, Clone, Default)]
pub struct GEntity {
    pub shared: SharedEntity,
    pub inuse: bool,
    pub freetime: i32,

    pub classname: String,
    pub spawnflags: i32,
    pub targetname: Option<String>,
    pub target: Option<String>,
    pub target2: Option<String>,
    pub target3: Option<String>,
    pub target4: Option<String>,
    pub target5: Option<String>,
    pub target6: Option<String>,
    pub script_targetname: Option<String>,
    pub closetarget: Option<String>,
    pub opentarget: Option<String>,
    pub paintarget: Option<String>,
    pub goaltarget: Option<String>,
    pub message: Option<String>,
    pub model: Option<String>,
    pub model2: Option<String>,
    pub team: Option<String>,
    pub fullname: Option<String>,
    pub ownername: Option<String>,
    pub roffname: Option<String>,
    pub rofftarget: Option<String>,
    pub soundset: Option<String>,
    pub healingclass: Option<String>,
    pub healingsound: Option<String>,
    pub target_shader_name: Option<String>,
    pub target_shader_new_name: Option<String>,
    /// Script names keyed by behavior (`spawn`, `use`, `death`, ...).
    pub behavior_set: HashMap<&'static str, String>,
    pub parms: [Option<String>; MAX_PARMS],

    pub health: i32,
    pub count: i32,
    pub damage: i32,
    pub delay: i32,
    pub delay_script_time: i32,
    pub healingrate: i32,
    pub allied_team: i32,
    pub teamnodmg: i32,
    pub alt_fire: i32,
    pub wait: f32,
    pub random: f32,
    pub speed: f32,
    pub radius: f32,
    pub mass: f32,

    /// Index into the item table.
    pub item: Option<usize>,
    pub think: Option<ThinkFn>,
    pub nextthink: i32,
}

impl GEntity {
    pub fn number(&self) -> usize {
        self.shared.s.number as usize
    }

    pub fn s(&self) -> &EntityState {
        &self.shared.s
    }

    /// Places the entity at rest at `origin`.
    pub fn set_origin(&mut self, origin: Vec3) {
        self.shared.s.pos.tr_base = origin;
        self.shared.s.pos.tr_type = Default::default();
        self.shared.s.pos.tr_time = 0;
        self.shared.s.pos.tr_duration = 0;
        self.shared.s.pos.tr_delta = Vec3::ZERO;
        self.shared.r.current_origin = origin;
    }
}

/// Fixed table of `MAX_GENTITIES` entities. Slots below `MAX_CLIENTS` belong
/// to players; `ENTITYNUM_WORLD` and `ENTITYNUM_NONE` are reserved.
#[derive(Debug)]
pub struct EntityTable {
    ents: Vec<GEntity>,
    num_entities: usize,
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityTable {
    pub fn new() -> Self {
        let ents = (0..MAX_GENTITIES)
            .map(|i| {
                let mut e = GEntity::default();
                e.shared.s = EntityState::with_number(i);
                e
            })
            .collect();
        Self {
            ents,
            num_entities: MAX_CLIENTS,
        }
    }

    /// One past the highest slot ever handed out.
    pub fn num_entities(&self) -> usize {
        self.num_entities
    }

    pub fn get(&self, num: usize) -> Option<&GEntity> {
        self.ents.get(num)
    }

    pub fn get_mut(&mut self, num: usize) -> Option<&mut GEntity> {
        self.ents.get_mut(num)
    }

    /// `G_Spawn`: first free slot at or above `MAX_CLIENTS`. Slots freed less
    /// than a second ago are skipped (unless the level is under two seconds
    /// old) so clients do not see a new entity lerp from the old one.
    pub fn spawn(&mut self, level_time: i32, start_time: i32) -> Result<usize, CapacityError> {
        for force in [false, true] {
            let found = (MAX_CLIENTS..self.num_entities).find(|&i| {
                let e = &self.ents[i];
                !e.inuse && (force || e.freetime <= start_time + 2000 || level_time - e.freetime >= 1000)
            });
            if let Some(i) = found {
                self.init_entity(i);
                return Ok(i);
            }
            if self.num_entities < ENTITYNUM_MAX_NORMAL {
                let i = self.num_entities;
                self.num_entities += 1;
                self.init_entity(i);
                return Ok(i);
            }
        }
        Err(CapacityError {
            table: "MAX_GENTITIES",
            capacity: ENTITYNUM_MAX_NORMAL,
        })
    }

    fn init_entity(&mut self, num: usize) {
        let e = &mut self.ents[num];
        *e = GEntity::default();
        e.inuse = true;
        e.classname = "noclass".to_string();
        e.shared.s = EntityState::with_number(num);
        e.shared.r.owner_num = ENTITYNUM_NONE as i32;
    }

    /// Takes a player slot for `client`.
    pub fn init_client_entity(&mut self, client: usize) -> &mut GEntity {
        self.init_entity(client);
        &mut self.ents[client]
    }

    /// Clears an entity. The caller unlinks it first.
    pub fn free(&mut self, num: usize, level_time: i32) {
        let Some(e) = self.ents.get_mut(num) else {
            return;
        };
        *e = GEntity::default();
        e.shared.s = EntityState::with_number(num);
        e.classname = "freed".to_string();
        e.freetime = level_time;
        e.inuse = false;
    }

    /// Prepares the two reserved entities.
    pub fn init_reserved(&mut self) {
        for (num, classname) in [(ENTITYNUM_WORLD, "worldspawn"), (ENTITYNUM_NONE, "nothing")] {
            let e = &mut self.ents[num];
            e.shared.s.number = num as i32;
            e.shared.r.owner_num = ENTITYNUM_NONE as i32;
            e.classname = classname.to_string();
        }
    }

    pub fn world(&self) -> &GEntity {
        &self.ents[ENTITYNUM_WORLD]
    }

    pub fn world_mut(&mut self) -> &mut GEntity {
        &mut self.ents[ENTITYNUM_WORLD]
    }

    /// Entities in use, in number order.
    pub fn iter_inuse(&self) -> impl Iterator<Item = &GEntity> {
        self.ents.iter().filter(|e| e.inuse)
    }

    /// Numbers of in-use entities whose classname matches.
    pub fn find_by_classname(&self, classname: &str) -> Vec<usize> {
        self.iter_inuse()
            .filter(|e| e.classname.eq_ignore_ascii_case(classname))
            .map(GEntity::number)
            .collect()
    }
}
