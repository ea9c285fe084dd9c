//! Item table and item spawning.

use jamp_shared::entity_state::EntityType;
use jamp_shared::game_api::GameImport;
use tracing::debug;

use crate::entity::CONTENTS_TRIGGER;
use crate::level::Gametype;
use crate::module::GameModule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Bad,
    Weapon,
    Ammo,
    Armor,
    Health,
    Powerup,
    Holdable,
    PersistantPowerup,
    Team,
}

#[derive(Debug, Clone, Copy)]
pub struct Item {
    pub classname: &'static str,
    pub pickup_name: &'static str,
    pub kind: ItemType,
    pub tag: i32,
    pub quantity: i32,
}

const fn item(classname: &'static str, pickup_name: &'static str, kind: ItemType, tag: i32, quantity: i32) -> Item {
    Item {
        classname,
        pickup_name,
        kind,
        tag,
        quantity,
    }
}

/// Slot 0 is the null item so a model index of 0 means "no item".
pub static ITEMS: &[Item] = &[
    item("", "", ItemType::Bad, 0, 0),
    item("item_shield_sm_instant", "Shield Small", ItemType::Armor, 1, 25),
    item("item_shield_lrg_instant", "Shield Large", ItemType::Armor, 2, 100),
    item("item_medpak_instant", "Medpack", ItemType::Health, 0, 25),
    item("item_seeker", "Seeker Drone", ItemType::Holdable, 1, 120),
    item("item_shield", "Forcefield", ItemType::Holdable, 2, 120),
    item("item_medpac", "Bacta Canister", ItemType::Holdable, 3, 25),
    item("item_force_enlighten_light", "Light Force Enlightenment", ItemType::Powerup, 12, 25),
    item("item_force_enlighten_dark", "Dark Force Enlightenment", ItemType::Powerup, 13, 25),
    item("item_force_boon", "Force Boon", ItemType::Powerup, 14, 25),
    item("item_ysalimari", "Ysalamiri", ItemType::Powerup, 15, 25),
    item("weapon_stun_baton", "Stun Baton", ItemType::Weapon, 1, 100),
    item("weapon_saber", "Lightsaber", ItemType::Weapon, 3, 100),
    item("weapon_blaster_pistol", "Blaster Pistol", ItemType::Weapon, 4, 100),
    item("weapon_concussion_rifle", "Concussion Rifle", ItemType::Weapon, 14, 50),
    item("weapon_bryar_pistol", "Bryar Pistol", ItemType::Weapon, 15, 100),
    item("weapon_blaster", "E11 Blaster Rifle", ItemType::Weapon, 5, 100),
    item("weapon_disruptor", "Tenloss Disruptor Rifle", ItemType::Weapon, 6, 100),
    item("weapon_bowcaster", "Wookiee Bowcaster", ItemType::Weapon, 7, 100),
    item("weapon_repeater", "Imperial Heavy Repeater", ItemType::Weapon, 8, 100),
    item("weapon_demp2", "DEMP2", ItemType::Weapon, 9, 100),
    item("weapon_flechette", "Golan Arms Flechette", ItemType::Weapon, 10, 100),
    item("weapon_rocket_launcher", "Merr-Sonn Missile System", ItemType::Weapon, 11, 3),
    item("ammo_thermal", "Thermal Detonators", ItemType::Ammo, 4, 4),
    item("ammo_tripmine", "Trip Mines", ItemType::Ammo, 5, 3),
    item("ammo_detpack", "Det Packs", ItemType::Ammo, 6, 3),
    item("ammo_force", "Force??", ItemType::Ammo, 0, 100),
    item("ammo_blaster", "Blaster Pack", ItemType::Ammo, 1, 100),
    item("ammo_powercell", "Power Cell", ItemType::Ammo, 2, 100),
    item("ammo_metallic_bolts", "Metallic Bolts", ItemType::Ammo, 3, 100),
    item("ammo_rockets", "Rockets", ItemType::Ammo, 7, 3),
    item("ammo_all", "Ammo (all)", ItemType::Ammo, -1, 0),
    item("team_CTF_redflag", "Red Flag", ItemType::Team, 1, 0),
    item("team_CTF_blueflag", "Blue Flag", ItemType::Team, 2, 0),
    item("team_CTY_redflag", "Red Ysalamiri", ItemType::Team, 1, 0),
    item("team_CTY_blueflag", "Blue Ysalamiri", ItemType::Team, 2, 0),
    item("item_redcube", "Neutral Cube", ItemType::Team, 1, 0),
    item("item_bluecube", "Neutral Cube", ItemType::Team, 2, 0),
];

/// Exact (case-sensitive) classname lookup, skipping the null item.
pub fn find_item(classname: &str) -> Option<usize> {
    ITEMS
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, it)| it.classname == classname)
        .map(|(i, _)| i)
}

/// `G_SpawnItem`: turns `num` into a pickup. The entity is linked on its
/// first think so it settles before baselines are taken.
pub fn spawn_item(game: &mut GameModule, num: usize, item_index: usize) {
    let Some(item) = ITEMS.get(item_index) else {
        return;
    };
    let time = game.level.time;

    if item.kind == ItemType::Team && !matches!(game.level.gametype, Gametype::Ctf | Gametype::Cty) {
        debug!(classname = item.classname, "team item outside a flag gametype");
        game.entities.free(num, time);
        return;
    }

    let Some(ent) = game.entities.get_mut(num) else {
        return;
    };
    ent.item = Some(item_index);
    ent.classname = item.classname.to_string();
    ent.shared.s.e_type = EntityType::Item;
    ent.shared.s.model_index = item_index as i32;
    ent.shared.r.contents = CONTENTS_TRIGGER;
    ent.think = Some(finish_spawning_item);
    ent.nextthink = time + 200;
}

fn finish_spawning_item(game: &mut GameModule, sys: &mut dyn GameImport, num: usize) {
    let Some(ent) = game.entities.get_mut(num) else {
        return;
    };
    let origin = ent.shared.s.origin;
    ent.set_origin(origin);
    ent.think = None;
    sys.link_entity(&mut ent.shared);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_exact_and_skips_null_item() {
        assert_eq!(find_item(""), None);
        let i = find_item("team_CTF_redflag").unwrap();
        assert_eq!(ITEMS[i].kind, ItemType::Team);
        assert_eq!(find_item("TEAM_ctf_redflag"), None);
    }
}
