//! Per-client snapshot construction.
//!
//! Each frame an active client gets the entities relevant to its viewpoint,
//! delta-compressed against the last snapshot it acknowledged. Entity
//! updates go out in strictly increasing entity number.

use std::cmp::Ordering;

use jamp_shared::entity_state::{EntityDelta, EntityState, PlayerState, PlayerStateDelta, SvFlags};
use jamp_shared::game_api::GameExport;
use jamp_shared::limits::{MAX_CLIENTS, MAX_SNAPSHOT_ENTITIES, PACKET_BACKUP};
use jamp_shared::math::Vec3;
use jamp_shared::net::{EntityChange, EntityUpdate, SnapshotMsg};
use tracing::warn;

use crate::client::{Client, ClientFrame, ClientState};
use crate::world::{Cluster, World};

/// Snapshots further back than this are not used as a reference.
pub const MAX_DELTA_AGE: i32 = PACKET_BACKUP as i32 - 3;

/// `snap_flags` bit: the server held this snapshot back for rate.
pub const SNAPFLAG_RATE_DELAYED: i32 = 1;

struct Candidate<'a> {
    num: usize,
    priority: bool,
    dist_sq: f32,
    state: &'a EntityState,
}

/// Entities `client_num` should receive, sorted by number.
///
/// When more than `MAX_SNAPSHOT_ENTITIES` qualify, the client's own and
/// broadcast entities are kept first, then the nearest, ties going to the
/// lower number.
pub fn select_entities(
    game: &dyn GameExport,
    world: &World,
    client_num: usize,
    viewer: Vec3,
    cull_distance: f32,
) -> Vec<EntityState> {
    let viewer_cluster = Cluster::containing(viewer);
    let cull_sq = cull_distance * cull_distance;
    let mut picked = Vec::new();

    for num in 0..game.num_entities() {
        let Some(ent) = game.shared_entity(num) else {
            continue;
        };
        if !ent.r.linked {
            continue;
        }
        if usize::try_from(ent.s.number).ok() != Some(num) {
            warn!(num, number = ent.s.number, "entity number mismatch, skipped");
            continue;
        }

        let flags = ent.r.svflags;
        if flags.contains(SvFlags::NOCLIENT) {
            continue;
        }
        if flags.contains(SvFlags::SINGLECLIENT) && ent.r.single_client != client_num as i32 {
            continue;
        }
        if flags.contains(SvFlags::NOTSINGLECLIENT) && ent.r.single_client == client_num as i32 {
            continue;
        }
        if flags.contains(SvFlags::CLIENTMASK) {
            if client_num >= MAX_CLIENTS || ent.r.single_client & (1 << client_num) == 0 {
                continue;
            }
        }

        let priority = num == client_num || flags.contains(SvFlags::BROADCAST);
        let dist_sq = ent.r.current_origin.distance_sq(viewer);
        if !priority {
            if !world.visible_from(num, viewer_cluster) {
                continue;
            }
            if cull_distance > 0.0 && dist_sq > cull_sq {
                continue;
            }
        }
        picked.push(Candidate {
            num,
            priority,
            dist_sq,
            state: &ent.s,
        });
    }

    if picked.len() > MAX_SNAPSHOT_ENTITIES {
        picked.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.dist_sq.partial_cmp(&b.dist_sq).unwrap_or(Ordering::Equal))
                .then_with(|| a.num.cmp(&b.num))
        });
        picked.truncate(MAX_SNAPSHOT_ENTITIES);
        picked.sort_by_key(|c| c.num);
    }
    picked.into_iter().map(|c| c.state.clone()).collect()
}

/// Captures what `client_num` sees this frame.
pub fn build_frame(
    game: &dyn GameExport,
    world: &World,
    client_num: usize,
    cull_distance: f32,
    server_time: i32,
) -> ClientFrame {
    let ps = game.player_state(client_num).cloned().unwrap_or_else(|| PlayerState {
        client_num: client_num as i32,
        ..Default::default()
    });
    let entities = select_entities(game, world, client_num, ps.view_origin(), cull_distance);
    ClientFrame {
        server_time,
        ps,
        entities,
        ..Default::default()
    }
}

/// The acknowledged frame to delta against, or `None` for a full snapshot.
pub fn delta_reference(client: &Client) -> Option<&ClientFrame> {
    if client.state != ClientState::Active {
        return None;
    }
    let delta = client.delta_message?;
    if delta <= 0 || delta >= client.netchan.outgoing_sequence {
        return None;
    }
    if client.netchan.outgoing_sequence - delta >= MAX_DELTA_AGE {
        return None;
    }
    let frame = client.frame(delta);
    (frame.message_num == delta).then_some(frame)
}

/// Entity changes from `from` to `to`. Entities new to the client are
/// sent against their spawn baseline, vanished ones as removals.
pub fn delta_entities(from: Option<&[EntityState]>, to: &[EntityState], world: &World) -> Vec<EntityUpdate> {
    let from = from.unwrap_or(&[]);
    let mut out = Vec::with_capacity(to.len());
    let (mut i, mut j) = (0, 0);

    let added = |state: &EntityState| {
        let num = state.number as usize;
        let delta = match world.baseline(num) {
            Some(base) => EntityDelta::between(base, state),
            None => EntityDelta::between(&EntityState::with_number(num), state),
        };
        EntityUpdate {
            number: num,
            change: EntityChange::Delta { delta },
        }
    };

    while i < from.len() || j < to.len() {
        let old = from.get(i);
        let new = to.get(j);
        match (old, new) {
            (Some(o), Some(n)) if o.number == n.number => {
                let delta = EntityDelta::between(o, n);
                if !delta.is_empty() {
                    out.push(EntityUpdate {
                        number: n.number as usize,
                        change: EntityChange::Delta { delta },
                    });
                }
                i += 1;
                j += 1;
            }
            (Some(o), Some(n)) if n.number < o.number => {
                out.push(added(n));
                j += 1;
            }
            (Some(o), _) => {
                out.push(EntityUpdate {
                    number: o.number as usize,
                    change: EntityChange::Remove,
                });
                i += 1;
            }
            (None, Some(n)) => {
                out.push(added(n));
                j += 1;
            }
            (None, None) => break,
        }
    }
    out
}

/// Encodes `frame` for the wire against an optional reference frame.
pub fn encode(frame: &ClientFrame, reference: Option<&ClientFrame>, world: &World, snap_flags: i32) -> SnapshotMsg {
    let player_state = match reference {
        Some(r) => PlayerStateDelta::between(&r.ps, &frame.ps),
        None => PlayerStateDelta::full(&frame.ps),
    };
    SnapshotMsg {
        server_time: frame.server_time,
        message_num: frame.message_num,
        delta_num: reference.map(|r| r.message_num),
        snap_flags,
        player_state,
        entities: delta_entities(reference.map(|r| r.entities.as_slice()), &frame.entities, world),
    }
}

/// Milliseconds a message of `size` bytes occupies at `rate` bytes/s.
pub fn rate_msec(rate: i32, size: usize) -> i32 {
    const HEADER_BYTES: usize = 48;
    let rate = rate.max(1000) as i64;
    ((size + HEADER_BYTES) as i64 * 1000 / rate) as i32
}
