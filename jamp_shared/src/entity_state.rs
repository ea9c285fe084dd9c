//! Networked entity/player state and their field-level deltas.
//!
//! `EntityState` and `PlayerState` are the only parts of the game module's
//! objects that travel to clients. They are sent as deltas: a
//! `EntityDelta`/`PlayerStateDelta` carries only the fields that differ from a
//! reference state (a previous snapshot or the entity's spawn baseline).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::limits::ENTITYNUM_NONE;
use crate::math::Vec3;

pub const MAX_STATS: usize = 16;
pub const MAX_PERSISTANT: usize = 16;

/// Trajectory evaluation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrType {
    #[default]
    Stationary,
    Interpolate,
    Linear,
    LinearStop,
    NonLinearStop,
    Sine,
    Gravity,
}

/// Parametric motion of an origin or angle set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Trajectory {
    pub tr_type: TrType,
    pub tr_time: i32,
    pub tr_duration: i32,
    pub tr_base: Vec3,
    pub tr_delta: Vec3,
}

impl Trajectory {
    /// Position at `time` (milliseconds).
    pub fn evaluate(&self, time: i32) -> Vec3 {
        match self.tr_type {
            TrType::Stationary | TrType::Interpolate => self.tr_base,
            TrType::Linear => {
                let dt = (time - self.tr_time) as f32 * 0.001;
                self.tr_base + self.tr_delta * dt
            }
            TrType::LinearStop | TrType::NonLinearStop => {
                let t = time.min(self.tr_time + self.tr_duration).max(self.tr_time);
                let dt = (t - self.tr_time) as f32 * 0.001;
                self.tr_base + self.tr_delta * dt
            }
            TrType::Sine => {
                let duration = self.tr_duration.max(1) as f32;
                let phase = ((time - self.tr_time) as f32 / duration) * std::f32::consts::TAU;
                self.tr_base + self.tr_delta * phase.sin()
            }
            TrType::Gravity => {
                let dt = (time - self.tr_time) as f32 * 0.001;
                let mut p = self.tr_base + self.tr_delta * dt;
                p.z -= 0.5 * 800.0 * dt * dt;
                p
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityType {
    #[default]
    General,
    Player,
    Item,
    Missile,
    Special,
    Holocron,
    Mover,
    Beam,
    Portal,
    Speaker,
    PushTrigger,
    TeleportTrigger,
    Invisible,
    Npc,
    Team,
    Body,
    Terrain,
    Fx,
}

/// The networked part of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub number: i32,
    pub e_type: EntityType,
    pub e_flags: i32,
    pub pos: Trajectory,
    pub apos: Trajectory,
    pub time: i32,
    pub time2: i32,
    pub origin: Vec3,
    pub origin2: Vec3,
    pub angles: Vec3,
    pub angles2: Vec3,
    pub other_entity_num: i32,
    pub ground_entity_num: i32,
    pub constant_light: i32,
    pub loop_sound: i32,
    pub model_index: i32,
    pub client_num: i32,
    pub frame: i32,
    pub solid: i32,
    pub event: i32,
    pub event_parm: i32,
    pub powerups: i32,
    pub weapon: i32,
    pub legs_anim: i32,
    pub torso_anim: i32,
    pub generic1: i32,
    pub teamowner: i32,
    pub sound_set_index: i32,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            number: 0,
            e_type: EntityType::General,
            e_flags: 0,
            pos: Trajectory::default(),
            apos: Trajectory::default(),
            time: 0,
            time2: 0,
            origin: Vec3::ZERO,
            origin2: Vec3::ZERO,
            angles: Vec3::ZERO,
            angles2: Vec3::ZERO,
            other_entity_num: ENTITYNUM_NONE as i32,
            ground_entity_num: ENTITYNUM_NONE as i32,
            constant_light: 0,
            loop_sound: 0,
            model_index: 0,
            client_num: 0,
            frame: 0,
            solid: 0,
            event: 0,
            event_parm: 0,
            powerups: 0,
            weapon: 0,
            legs_anim: 0,
            torso_anim: 0,
            generic1: 0,
            teamowner: 0,
            sound_set_index: 0,
        }
    }
}

impl EntityState {
    pub fn with_number(number: usize) -> Self {
        Self {
            number: number as i32,
            ..Default::default()
        }
    }
}

/// The networked part of a player, sent only to the owning client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub command_time: i32,
    pub pm_type: i32,
    pub pm_flags: i32,
    pub pm_time: i32,
    pub origin: Vec3,
    pub velocity: Vec3,
    pub view_angles: Vec3,
    pub delta_angles: [i32; 3],
    pub gravity: i32,
    pub speed: i32,
    pub ground_entity_num: i32,
    pub client_num: i32,
    pub weapon: i32,
    pub weapon_state: i32,
    pub view_height: i32,
    pub event_sequence: i32,
    pub stats: [i32; MAX_STATS],
    pub persistant: [i32; MAX_PERSISTANT],
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            command_time: 0,
            pm_type: 0,
            pm_flags: 0,
            pm_time: 0,
            origin: Vec3::ZERO,
            velocity: Vec3::ZERO,
            view_angles: Vec3::ZERO,
            delta_angles: [0; 3],
            gravity: 800,
            speed: 250,
            ground_entity_num: ENTITYNUM_NONE as i32,
            client_num: 0,
            weapon: 0,
            weapon_state: 0,
            view_height: 0,
            event_sequence: 0,
            stats: [0; MAX_STATS],
            persistant: [0; MAX_PERSISTANT],
        }
    }
}

impl PlayerState {
    /// Viewpoint used for visibility tests.
    pub fn view_origin(&self) -> Vec3 {
        let mut v = self.origin;
        v.z += self.view_height as f32;
        v
    }
}

/// One frame of client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserCmd {
    pub server_time: i32,
    pub angles: [i32; 3],
    pub buttons: i32,
    pub weapon: u8,
    pub forwardmove: i8,
    pub rightmove: i8,
    pub upmove: i8,
    pub generic_cmd: u8,
}

bitflags! {
    /// Server-side entity flags controlling snapshot inclusion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SvFlags: u32 {
        /// Never sent to any client.
        const NOCLIENT = 1 << 0;
        /// `single_client` is a bitmask of receiving clients.
        const CLIENTMASK = 1 << 1;
        const BOT = 1 << 3;
        const PLAYER_USABLE = 1 << 4;
        /// Sent to every client regardless of visibility.
        const BROADCAST = 1 << 5;
        const PORTAL = 1 << 6;
        const USE_CURRENT_ORIGIN = 1 << 7;
        /// Only sent to `single_client`.
        const SINGLECLIENT = 1 << 8;
        const NOSERVERINFO = 1 << 9;
        const CAPSULE = 1 << 10;
        /// Sent to everyone except `single_client`.
        const NOTSINGLECLIENT = 1 << 11;
    }
}

/// Server-visible, non-networked entity data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityShared {
    pub linked: bool,
    pub link_count: i32,
    pub svflags: SvFlags,
    pub single_client: i32,
    pub bmodel: bool,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub contents: i32,
    pub absmin: Vec3,
    pub absmax: Vec3,
    pub current_origin: Vec3,
    pub current_angles: Vec3,
    pub owner_num: i32,
}

/// What the game module exposes of each entity to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedEntity {
    pub s: EntityState,
    pub r: EntityShared,
}

macro_rules! field_delta {
    ($(#[$meta:meta])* $name:ident for $base:ty { $($field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        impl $name {
            /// Fields of `to` that differ from `from`.
            pub fn between(from: &$base, to: &$base) -> Self {
                Self {
                    $($field: (from.$field != to.$field).then(|| to.$field.clone()),)*
                }
            }

            /// Every field of `to`, for sends with no reference state.
            pub fn full(to: &$base) -> Self {
                Self {
                    $($field: Some(to.$field.clone()),)*
                }
            }

            /// Rebuilds the target state from `base`.
            pub fn apply(&self, base: &$base) -> $base {
                let mut out = base.clone();
                $(
                    if let Some(v) = &self.$field {
                        out.$field = v.clone();
                    }
                )*
                out
            }

            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }

            pub fn changed_fields(&self) -> usize {
                0 $(+ usize::from(self.$field.is_some()))*
            }
        }
    };
}

field_delta! {
    /// Changed fields of an `EntityState`. The entity number travels beside it.
    EntityDelta for EntityState {
        e_type: EntityType,
        e_flags: i32,
        pos: Trajectory,
        apos: Trajectory,
        time: i32,
        time2: i32,
        origin: Vec3,
        origin2: Vec3,
        angles: Vec3,
        angles2: Vec3,
        other_entity_num: i32,
        ground_entity_num: i32,
        constant_light: i32,
        loop_sound: i32,
        model_index: i32,
        client_num: i32,
        frame: i32,
        solid: i32,
        event: i32,
        event_parm: i32,
        powerups: i32,
        weapon: i32,
        legs_anim: i32,
        torso_anim: i32,
        generic1: i32,
        teamowner: i32,
        sound_set_index: i32,
    }
}

field_delta! {
    /// Changed fields of a `PlayerState`.
    PlayerStateDelta for PlayerState {
        command_time: i32,
        pm_type: i32,
        pm_flags: i32,
        pm_time: i32,
        origin: Vec3,
        velocity: Vec3,
        view_angles: Vec3,
        delta_angles: [i32; 3],
        gravity: i32,
        speed: i32,
        ground_entity_num: i32,
        client_num: i32,
        weapon: i32,
        weapon_state: i32,
        view_height: i32,
        event_sequence: i32,
        stats: [i32; MAX_STATS],
        persistant: [i32; MAX_PERSISTANT],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_carries_only_changed_fields() {
        let a = EntityState::with_number(5);
        let mut b = a.clone();
        b.origin = Vec3::new(1.0, 2.0, 3.0);
        b.frame = 7;

        let d = EntityDelta::between(&a, &b);
        assert_eq!(d.changed_fields(), 2);
        assert_eq!(d.apply(&a), b);
        assert!(EntityDelta::between(&b, &b).is_empty());
    }

    #[test]
    fn unchanged_fields_are_not_serialized() {
        let a = PlayerState::default();
        let mut b = a.clone();
        b.command_time = 100;
        let json = serde_json::to_string(&PlayerStateDelta::between(&a, &b)).unwrap();
        assert_eq!(json, r#"{"command_time":100}"#);
    }

    #[test]
    fn linear_stop_clamps_at_duration() {
        let tr = Trajectory {
            tr_type: TrType::LinearStop,
            tr_time: 1000,
            tr_duration: 500,
            tr_base: Vec3::ZERO,
            tr_delta: Vec3::new(100.0, 0.0, 0.0),
        };
        assert_eq!(tr.evaluate(1250).x, 25.0);
        assert_eq!(tr.evaluate(5000).x, 50.0);
    }
}
