//! Snapshot reconstruction.
//!
//! Each received snapshot is rebuilt against the frame it was delta
//! compressed from and stored in a ring of `PACKET_BACKUP` frames, so later
//! snapshots can reference it in turn.

use thiserror::Error;

use jamp_shared::entity_state::{EntityState, PlayerState};
use jamp_shared::limits::{MAX_GENTITIES, PACKET_BACKUP};
use jamp_shared::net::{EntityChange, EntityUpdate, SnapshotMsg};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("delta from invalid frame {0}")]
    UnknownFrame(i32),
    #[error("delta frame {delta} too old for message {message}")]
    TooOld { delta: i32, message: i32 },
    #[error("entity {got} out of order after {after}")]
    OutOfOrder { got: usize, after: usize },
    #[error("bad entity number {0}")]
    BadNumber(usize),
}

/// A fully reconstructed snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSnapshot {
    pub valid: bool,
    pub message_num: i32,
    pub delta_num: Option<i32>,
    pub server_time: i32,
    pub snap_flags: i32,
    pub ps: PlayerState,
    /// Sorted by number.
    pub entities: Vec<EntityState>,
}

impl ClientSnapshot {
    pub fn entity(&self, number: usize) -> Option<&EntityState> {
        self.entities
            .binary_search_by_key(&(number as i32), |e| e.number)
            .ok()
            .map(|i| &self.entities[i])
    }
}

/// Received snapshots indexed by message number.
#[derive(Debug, Clone)]
pub struct SnapshotRing {
    frames: Vec<ClientSnapshot>,
    baselines: Vec<Option<EntityState>>,
}

impl Default for SnapshotRing {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotRing {
    pub fn new() -> Self {
        Self {
            frames: vec![ClientSnapshot::default(); PACKET_BACKUP],
            baselines: vec![None; MAX_GENTITIES],
        }
    }

    /// Forgets every stored frame, keeping the baselines.
    pub fn invalidate(&mut self) {
        self.frames.iter_mut().for_each(|f| f.valid = false);
    }

    /// Replaces the baselines from a new gamestate and drops all frames.
    pub fn reset(&mut self, baselines: &[EntityState]) {
        self.invalidate();
        self.baselines.iter_mut().for_each(|b| *b = None);
        for b in baselines {
            if let Some(slot) = usize::try_from(b.number).ok().and_then(|n| self.baselines.get_mut(n)) {
                *slot = Some(b.clone());
            }
        }
    }

    pub fn baseline(&self, number: usize) -> Option<&EntityState> {
        self.baselines.get(number).and_then(Option::as_ref)
    }

    /// The stored frame for `message_num`, if it has not been overwritten.
    pub fn get(&self, message_num: i32) -> Option<&ClientSnapshot> {
        let frame = &self.frames[message_num.rem_euclid(PACKET_BACKUP as i32) as usize];
        (frame.valid && frame.message_num == message_num).then_some(frame)
    }

    /// `CL_ParseSnapshot`: rebuilds `msg` and stores it.
    pub fn decode(&mut self, msg: &SnapshotMsg) -> Result<&ClientSnapshot, SnapshotError> {
        let empty = ClientSnapshot::default();
        let reference = match msg.delta_num {
            None => &empty,
            Some(delta) => {
                if msg.message_num - delta >= PACKET_BACKUP as i32 {
                    return Err(SnapshotError::TooOld {
                        delta,
                        message: msg.message_num,
                    });
                }
                self.get(delta).ok_or(SnapshotError::UnknownFrame(delta))?
            }
        };

        let entities = merge_entities(&reference.entities, &msg.entities, &self.baselines)?;
        let snap = ClientSnapshot {
            valid: true,
            message_num: msg.message_num,
            delta_num: msg.delta_num,
            server_time: msg.server_time,
            snap_flags: msg.snap_flags,
            ps: msg.player_state.apply(&reference.ps),
            entities,
        };
        let slot = &mut self.frames[msg.message_num.rem_euclid(PACKET_BACKUP as i32) as usize];
        *slot = snap;
        Ok(slot)
    }
}

/// Applies updates, which must be in strictly increasing entity order, to
/// the reference entity list.
fn merge_entities(
    old: &[EntityState],
    updates: &[EntityUpdate],
    baselines: &[Option<EntityState>],
) -> Result<Vec<EntityState>, SnapshotError> {
    let mut out = Vec::with_capacity(old.len() + updates.len());
    let mut old_iter = old.iter().peekable();
    let mut last: Option<usize> = None;

    for update in updates {
        let n = update.number;
        if n >= MAX_GENTITIES {
            return Err(SnapshotError::BadNumber(n));
        }
        if let Some(prev) = last.filter(|&prev| n <= prev) {
            return Err(SnapshotError::OutOfOrder { got: n, after: prev });
        }
        last = Some(n);

        // Unchanged entities below this number carry over.
        while let Some(e) = old_iter.next_if(|e| (e.number as usize) < n) {
            out.push(e.clone());
        }
        let previous = old_iter.next_if(|e| e.number as usize == n);

        match &update.change {
            EntityChange::Remove => {}
            EntityChange::Delta { delta } => {
                let base = previous
                    .cloned()
                    .or_else(|| baselines[n].clone())
                    .unwrap_or_else(|| EntityState::with_number(n));
                let mut state = delta.apply(&base);
                state.number = n as i32;
                out.push(state);
            }
        }
    }
    out.extend(old_iter.cloned());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jamp_shared::entity_state::{EntityDelta, PlayerStateDelta};
    use jamp_shared::math::Vec3;

    fn ent(n: usize, x: f32) -> EntityState {
        let mut e = EntityState::with_number(n);
        e.origin = Vec3::new(x, 0.0, 0.0);
        e
    }

    fn delta(n: usize, from: &EntityState, to: &EntityState) -> EntityUpdate {
        EntityUpdate {
            number: n,
            change: EntityChange::Delta {
                delta: EntityDelta::between(from, to),
            },
        }
    }

    fn snap(message_num: i32, delta_num: Option<i32>, entities: Vec<EntityUpdate>) -> SnapshotMsg {
        SnapshotMsg {
            server_time: message_num * 50,
            message_num,
            delta_num,
            snap_flags: 0,
            player_state: PlayerStateDelta::default(),
            entities,
        }
    }

    #[test]
    fn full_then_delta_snapshot() {
        let mut ring = SnapshotRing::new();
        ring.reset(&[ent(70, 5.0)]);

        let empty = EntityState::with_number(0);
        let full = snap(3, None, vec![delta(1, &empty, &ent(1, 10.0)), delta(70, &ent(70, 5.0), &ent(70, 5.0))]);
        let first = ring.decode(&full).unwrap();
        assert_eq!(first.entities.len(), 2);
        assert_eq!(first.entity(70).unwrap().origin.x, 5.0);

        let next = snap(
            4,
            Some(3),
            vec![
                delta(1, &ent(1, 10.0), &ent(1, 12.0)),
                delta(
                    40,
                    &EntityState::with_number(40),
                    &ent(40, 1.0),
                ),
                EntityUpdate {
                    number: 70,
                    change: EntityChange::Remove,
                },
            ],
        );
        let second = ring.decode(&next).unwrap();
        let numbers: Vec<i32> = second.entities.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 40]);
        assert_eq!(second.entity(1).unwrap().origin.x, 12.0);
    }

    #[test]
    fn unknown_reference_frame_is_rejected() {
        let mut ring = SnapshotRing::new();
        ring.decode(&snap(5, None, Vec::new())).unwrap();
        assert_eq!(ring.decode(&snap(7, Some(6), Vec::new())), Err(SnapshotError::UnknownFrame(6)));
        assert!(matches!(
            ring.decode(&snap(5 + PACKET_BACKUP as i32, Some(5), Vec::new())),
            Err(SnapshotError::TooOld { .. })
        ));
        ring.invalidate();
        assert!(ring.get(5).is_none());
    }

    #[test]
    fn entities_must_arrive_in_order() {
        let mut ring = SnapshotRing::new();
        let a = EntityState::with_number(9);
        let msg = snap(1, None, vec![delta(9, &a, &a), delta(3, &a, &a)]);
        assert_eq!(ring.decode(&msg), Err(SnapshotError::OutOfOrder { got: 3, after: 9 }));
        let dup = snap(2, None, vec![delta(9, &a, &a), delta(9, &a, &a)]);
        assert!(ring.decode(&dup).is_err());
    }
}
