//! Per-level game state.

use serde::{Deserialize, Serialize};

use jamp_shared::math::Vec3;

use crate::spawn::SpawnVars;

/// Game modes, in `g_gametype` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Gametype {
    #[default]
    Ffa,
    Holocron,
    JediMaster,
    Duel,
    PowerDuel,
    Team,
    Ctf,
    Cty,
}

impl Gametype {
    pub const ALL: [Gametype; 8] = [
        Gametype::Ffa,
        Gametype::Holocron,
        Gametype::JediMaster,
        Gametype::Duel,
        Gametype::PowerDuel,
        Gametype::Team,
        Gametype::Ctf,
        Gametype::Cty,
    ];

    /// Out-of-range values fall back to free-for-all.
    pub fn from_cvar(v: i64) -> Self {
        usize::try_from(v)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or_default()
    }

    /// Name matched against an entity's `gametype` key.
    pub fn short_name(self) -> &'static str {
        match self {
            Gametype::Ffa => "ffa",
            Gametype::Holocron => "holocron",
            Gametype::JediMaster => "jedimaster",
            Gametype::Duel => "duel",
            Gametype::PowerDuel => "powerduel",
            Gametype::Team => "team",
            Gametype::Ctf => "ctf",
            Gametype::Cty => "cty",
        }
    }

    pub fn is_team(self) -> bool {
        self >= Gametype::Team
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Team {
    #[default]
    Free,
    Red,
    Blue,
    Spectator,
}

impl Team {
    pub fn parse(s: &str) -> Option<Team> {
        match s.to_ascii_lowercase().as_str() {
            "free" | "f" => Some(Team::Free),
            "red" | "r" => Some(Team::Red),
            "blue" | "b" => Some(Team::Blue),
            "spectator" | "s" => Some(Team::Spectator),
            _ => None,
        }
    }
}

/// Transform applied to the entities of an instanced sub-map.
#[derive(Debug, Clone, PartialEq)]
pub struct SubBspAdjust {
    pub origin: Vec3,
    /// Yaw rotation in degrees.
    pub rotation: f32,
    /// Prefix added to target names, e.g. `"1-"`.
    pub target_prefix: String,
}

/// Counters for one `spawn_entities_from_string` run, sub-maps included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnStats {
    pub spawned: usize,
    pub filtered: usize,
    /// Classnames with no item or constructor.
    pub unknown: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LevelLocals {
    pub time: i32,
    pub previous_time: i32,
    pub start_time: i32,
    pub random_seed: i32,
    pub gametype: Gametype,
    pub restarted: bool,

    /// Set while entity text is being consumed.
    pub spawning: bool,
    pub spawn_vars: SpawnVars,
    pub stats: SpawnStats,

    pub bsp_adjust: Option<SubBspAdjust>,
    pub num_bsp_instances: u32,
    pub bsp_instance_depth: u32,
    pub team_filter: String,

    pub cull_distance: f32,
    pub warmup_time: i32,

    pub locations: Vec<String>,
    pub locations_linked: bool,
}

impl LevelLocals {
    pub fn new(level_time: i32, random_seed: i32, gametype: Gametype, restarted: bool) -> Self {
        Self {
            time: level_time,
            previous_time: level_time,
            start_time: level_time,
            random_seed,
            gametype,
            restarted,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gametype_from_cvar() {
        assert_eq!(Gametype::from_cvar(6), Gametype::Ctf);
        assert_eq!(Gametype::from_cvar(99), Gametype::Ffa);
        assert_eq!(Gametype::from_cvar(-1), Gametype::Ffa);
        assert!(Gametype::Cty.is_team());
        assert!(!Gametype::PowerDuel.is_team());
    }
}
