//! Classname constructors.

use tracing::{debug, warn};

use jamp_shared::entity_state::EntityType;
use jamp_shared::game_api::GameImport;
use jamp_shared::limits::MAX_LOCATIONS;
use jamp_shared::math::YAW;

use crate::items::{find_item, spawn_item};
use crate::level::SubBspAdjust;
use crate::module::GameModule;
use crate::spawn::{spawn_entities_from_string, SpawnError, SpawnRegistry};

type SpawnResult = Result<(), SpawnError>;

/// Every classname the game knows besides items.
pub fn default_registry() -> SpawnRegistry {
    let mut r = SpawnRegistry::default();
    r.register("info_null", info_null);
    r.register("func_group", info_null);
    r.register("light", light);
    r.register("info_notnull", info_notnull);
    r.register("target_position", info_notnull);
    r.register("info_player_start", info_player_start);
    r.register("info_player_deathmatch", info_player_deathmatch);
    r.register("info_player_duel", info_player_deathmatch);
    r.register("info_player_duel1", info_player_deathmatch);
    r.register("info_player_duel2", info_player_deathmatch);
    r.register("info_player_start_red", info_player_deathmatch);
    r.register("info_player_start_blue", info_player_deathmatch);
    r.register("team_CTF_redplayer", info_player_deathmatch);
    r.register("team_CTF_blueplayer", info_player_deathmatch);
    r.register("team_CTF_redspawn", info_player_deathmatch);
    r.register("team_CTF_bluespawn", info_player_deathmatch);
    r.register("info_player_intermission", info_player_intermission);
    r.register("info_player_intermission_red", info_player_intermission);
    r.register("info_player_intermission_blue", info_player_intermission);
    r.register("item_botroam", item_botroam);
    r.register("path_corner", path_corner);
    r.register("target_location", target_location);
    r.register("gametype_item", gametype_item);
    r.register("misc_bsp", misc_bsp);
    r
}

fn set_origin_in_place(game: &mut GameModule, num: usize) {
    if let Some(e) = game.entities.get_mut(num) {
        let origin = e.shared.s.origin;
        e.set_origin(origin);
    }
}

/// Used as a positional target for spotlights and the like. Removes itself.
fn info_null(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    game.free_entity(sys, num);
    Ok(())
}

/// Lights only matter to the map compiler.
fn light(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    game.free_entity(sys, num);
    Ok(())
}

fn info_notnull(game: &mut GameModule, _sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    set_origin_in_place(game, num);
    Ok(())
}

fn info_player_start(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    if let Some(e) = game.entities.get_mut(num) {
        e.classname = "info_player_deathmatch".to_string();
    }
    info_player_deathmatch(game, sys, num)
}

fn info_player_deathmatch(game: &mut GameModule, _sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    let (_, nobots) = game.level.spawn_vars.int("nobots", "0");
    let (_, nohumans) = game.level.spawn_vars.int("nohumans", "0");
    set_origin_in_place(game, num);
    if let Some(e) = game.entities.get_mut(num) {
        if nobots != 0 {
            e.spawnflags |= 1;
        }
        if nohumans != 0 {
            e.spawnflags |= 2;
        }
    }
    Ok(())
}

fn info_player_intermission(game: &mut GameModule, _sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    set_origin_in_place(game, num);
    Ok(())
}

/// Hint for bot navigation; nothing to do at runtime.
fn item_botroam(_game: &mut GameModule, _sys: &mut dyn GameImport, _num: usize) -> SpawnResult {
    Ok(())
}

fn path_corner(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    let Some(e) = game.entities.get(num) else {
        return Ok(());
    };
    if e.targetname.is_none() {
        warn!(origin = %e.shared.s.origin.to_rounded_string(), "path_corner with no targetname");
        game.free_entity(sys, num);
        return Ok(());
    }
    set_origin_in_place(game, num);
    Ok(())
}

/// Named area reported in team chat. Indices start at 1; 0 is "unknown".
fn target_location(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    if game.level.locations.len() >= MAX_LOCATIONS - 1 {
        warn!("target_location: too many locations");
        game.free_entity(sys, num);
        return Ok(());
    }
    let message = game
        .entities
        .get(num)
        .and_then(|e| e.message.clone())
        .unwrap_or_default();
    game.level.locations.push(message);
    let index = game.level.locations.len() as i32;
    set_origin_in_place(game, num);
    if let Some(e) = game.entities.get_mut(num) {
        e.health = index;
    }
    Ok(())
}

/// Flag placeholder used by sub-maps. A red or blue team filter turns any
/// `*flag*` placeholder into that team's flag; otherwise the targetname
/// picks the colour.
fn gametype_item(game: &mut GameModule, _sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    set_origin_in_place(game, num);

    let filter = game.level.team_filter.to_ascii_lowercase();
    let team_red = match filter.as_str() {
        "red" => Some(true),
        "blue" => Some(false),
        _ => None,
    };

    let Some(targetname) = game.entities.get(num).and_then(|e| e.targetname.clone()) else {
        return Ok(());
    };
    if targetname.is_empty() {
        return Ok(());
    }

    let classname = match team_red {
        Some(red) if targetname.contains("flag") => Some(if red { "team_CTF_redflag" } else { "team_CTF_blueflag" }),
        Some(_) => None,
        None if targetname.contains("red_flag") => Some("team_CTF_redflag"),
        None if targetname.contains("blue_flag") => Some("team_CTF_blueflag"),
        None => None,
    };

    let Some(item_index) = classname.and_then(find_item) else {
        return Ok(());
    };
    if let Some(e) = game.entities.get_mut(num) {
        e.targetname = None;
    }
    spawn_item(game, num, item_index);
    debug!(num, targetname = %targetname, "gametype_item resolved");
    Ok(())
}

/// Instances another map's entities at this entity's origin and yaw.
fn misc_bsp(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) -> SpawnResult {
    let (_, bsp) = game.level.spawn_vars.string("bspmodel", "");
    let bsp = bsp.to_string();
    let team_filter = game.level.spawn_vars.string("teamfilter", "").1.to_string();
    let (_, spacing) = game.level.spawn_vars.int("spacing", "0");
    let (_, flatten) = game.level.spawn_vars.int("flatten", "0");

    if bsp.is_empty() {
        warn!(num, "misc_bsp without a bspmodel");
        game.free_entity(sys, num);
        return Ok(());
    }

    let model_index = game.model_index(sys, &format!("#{bsp}"));
    let (origin, angles) = match game.entities.get_mut(num) {
        Some(e) => {
            e.shared.s.time2 = spacing;
            e.shared.s.time = flatten;
            e.shared.s.model_index = model_index;
            e.shared.s.e_type = EntityType::Mover;
            let origin = e.shared.s.origin;
            let angles = e.shared.s.angles;
            e.set_origin(origin);
            e.shared.s.apos.tr_base = angles;
            e.shared.r.current_angles = angles;
            e.shared.r.bmodel = true;
            sys.link_entity(&mut e.shared);
            (origin, angles)
        }
        None => return Ok(()),
    };

    if !sys.set_active_sub_bsp(Some(&bsp)) {
        warn!(bsp = %bsp, "misc_bsp: sub-map could not be loaded");
        return Ok(());
    }

    game.level.num_bsp_instances += 1;
    let adjust = SubBspAdjust {
        origin,
        rotation: angles.get(YAW),
        target_prefix: format!("{}-", game.level.num_bsp_instances),
    };
    let saved_adjust = game.level.bsp_adjust.replace(adjust);
    let saved_filter = std::mem::replace(&mut game.level.team_filter, team_filter);
    game.level.bsp_instance_depth += 1;

    let result = spawn_entities_from_string(game, sys, true);

    game.level.bsp_instance_depth -= 1;
    game.level.bsp_adjust = saved_adjust;
    game.level.team_filter = saved_filter;
    sys.set_active_sub_bsp(None);
    result
}
