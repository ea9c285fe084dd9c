//! Server-side entity bookkeeping: link state, visibility clusters and
//! spawn baselines.
//!
//! Visibility uses a uniform grid of clusters on the horizontal plane. A
//! viewer sees every cluster within `PVS_RADIUS` cells of its own. An entity
//! spanning more than `MAX_ENT_CLUSTERS` cells is treated as visible from
//! anywhere.

use jamp_shared::entity_state::{EntityState, SharedEntity};
use jamp_shared::limits::{MAX_ENT_CLUSTERS, MAX_GENTITIES};
use jamp_shared::math::Vec3;
use tracing::warn;

pub const CLUSTER_SIZE: f32 = 1024.0;
pub const PVS_RADIUS: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cluster {
    pub x: i32,
    pub y: i32,
}

impl Cluster {
    pub fn containing(p: Vec3) -> Self {
        Self {
            x: (p.x / CLUSTER_SIZE).floor() as i32,
            y: (p.y / CLUSTER_SIZE).floor() as i32,
        }
    }

    pub fn sees(self, other: Cluster) -> bool {
        (self.x - other.x).abs() <= PVS_RADIUS && (self.y - other.y).abs() <= PVS_RADIUS
    }
}

/// Engine-side companion of one game entity. Valid only while the entity is
/// linked.
#[derive(Debug, Clone, Default)]
pub struct SvEntity {
    pub linked: bool,
    pub clusters: Vec<Cluster>,
    /// Spans too many clusters to list.
    pub everywhere: bool,
    pub baseline: Option<EntityState>,
}

#[derive(Debug)]
pub struct World {
    entities: Vec<SvEntity>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            entities: vec![SvEntity::default(); MAX_GENTITIES],
        }
    }

    /// Drops all links and baselines.
    pub fn clear(&mut self) {
        self.entities.iter_mut().for_each(|e| *e = SvEntity::default());
    }

    pub fn get(&self, num: usize) -> Option<&SvEntity> {
        self.entities.get(num)
    }

    /// `SV_LinkEntity`: computes bounds and clusters and marks the entity
    /// linked.
    pub fn link(&mut self, ent: &mut SharedEntity) {
        let Some(sv) = usize::try_from(ent.s.number).ok().and_then(|n| self.entities.get_mut(n)) else {
            warn!(number = ent.s.number, "SV_LinkEntity: bad entity number");
            return;
        };

        let origin = ent.r.current_origin;
        ent.r.absmin = origin + ent.r.mins - Vec3::new(1.0, 1.0, 1.0);
        ent.r.absmax = origin + ent.r.maxs + Vec3::new(1.0, 1.0, 1.0);

        let lo = Cluster::containing(ent.r.absmin);
        let hi = Cluster::containing(ent.r.absmax);
        let count = ((hi.x - lo.x + 1) * (hi.y - lo.y + 1)) as usize;

        sv.clusters.clear();
        sv.everywhere = count > MAX_ENT_CLUSTERS;
        if !sv.everywhere {
            for x in lo.x..=hi.x {
                for y in lo.y..=hi.y {
                    sv.clusters.push(Cluster { x, y });
                }
            }
        }
        sv.linked = true;
        ent.r.linked = true;
        ent.r.link_count += 1;
    }

    pub fn unlink(&mut self, ent: &mut SharedEntity) {
        ent.r.linked = false;
        if let Some(sv) = usize::try_from(ent.s.number).ok().and_then(|n| self.entities.get_mut(n)) {
            sv.linked = false;
            sv.clusters.clear();
            sv.everywhere = false;
        }
    }

    /// Cluster test from a viewer's cluster.
    pub fn visible_from(&self, num: usize, viewer: Cluster) -> bool {
        match self.entities.get(num) {
            Some(sv) if sv.linked => sv.everywhere || sv.clusters.iter().any(|c| viewer.sees(*c)),
            _ => false,
        }
    }

    pub fn set_baseline(&mut self, num: usize, state: EntityState) {
        if let Some(sv) = self.entities.get_mut(num) {
            sv.baseline = Some(state);
        }
    }

    pub fn baseline(&self, num: usize) -> Option<&EntityState> {
        self.entities.get(num).and_then(|e| e.baseline.as_ref())
    }

    pub fn baselines(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.iter().filter_map(|e| e.baseline.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(num: i32, origin: Vec3) -> SharedEntity {
        let mut e = SharedEntity::default();
        e.s.number = num;
        e.r.current_origin = origin;
        e.r.mins = Vec3::new(-16.0, -16.0, -16.0);
        e.r.maxs = Vec3::new(16.0, 16.0, 16.0);
        e
    }

    #[test]
    fn linked_entities_are_seen_from_nearby_clusters() {
        let mut w = World::new();
        let mut e = entity(40, Vec3::new(100.0, 100.0, 0.0));
        w.link(&mut e);
        assert!(e.r.linked);
        assert_eq!(e.r.link_count, 1);
        assert!(w.visible_from(40, Cluster::containing(Vec3::new(2000.0, 0.0, 0.0))));
        assert!(!w.visible_from(40, Cluster::containing(Vec3::new(9000.0, 0.0, 0.0))));

        w.unlink(&mut e);
        assert!(!w.visible_from(40, Cluster::containing(Vec3::ZERO)));
    }

    #[test]
    fn straddling_and_huge_entities() {
        let mut w = World::new();
        let mut edge = entity(41, Vec3::new(1024.0, 0.0, 0.0));
        w.link(&mut edge);
        assert_eq!(w.get(41).unwrap().clusters.len(), 4);

        let mut huge = entity(42, Vec3::ZERO);
        huge.r.mins = Vec3::new(-5000.0, -5000.0, 0.0);
        huge.r.maxs = Vec3::new(5000.0, 5000.0, 0.0);
        w.link(&mut huge);
        assert!(w.get(42).unwrap().everywhere);
        assert!(w.visible_from(42, Cluster::containing(Vec3::new(90_000.0, 0.0, 0.0))));
    }
}
