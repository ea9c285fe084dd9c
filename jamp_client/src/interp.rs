//! Interpolation between the two most recent snapshots.

use jamp_shared::math::Vec3;

use crate::snapshot::ClientSnapshot;

/// Fraction of the way from `prev` to `next` at client time `time`.
pub fn frame_interpolation(prev: &ClientSnapshot, next: &ClientSnapshot, time: i32) -> f32 {
    let span = next.server_time - prev.server_time;
    if span <= 0 {
        return 1.0;
    }
    ((time - prev.server_time) as f32 / span as f32).clamp(0.0, 1.0)
}

/// Interpolated origin of entity `number`, evaluating each snapshot's
/// trajectory at its own server time. Entities missing from the older
/// snapshot snap to the newer position.
pub fn entity_origin(prev: &ClientSnapshot, next: &ClientSnapshot, number: usize, time: i32) -> Option<Vec3> {
    let to = next.entity(number)?;
    let to_pos = to.pos.evaluate(next.server_time);
    let Some(from) = prev.entity(number) else {
        return Some(to_pos);
    };
    let from_pos = from.pos.evaluate(prev.server_time);
    Some(from_pos.lerp(to_pos, frame_interpolation(prev, next, time)))
}
