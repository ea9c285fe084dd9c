//! Input sampling.
//!
//! Turns the current movement intent into a `UserCmd` stamped with the
//! server time the client believes it is at.

use jamp_shared::entity_state::UserCmd;
use jamp_shared::math::Vec3;

pub const BUTTON_ATTACK: i32 = 1;
pub const BUTTON_USE: i32 = 1 << 5;

/// Movement intent, each axis in `-1.0..=1.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub forward: f32,
    pub right: f32,
    pub up: f32,
    /// Pitch, yaw, roll in degrees.
    pub view_angles: Vec3,
    pub buttons: i32,
    pub weapon: u8,
}

/// Degrees to the 16-bit wire angle.
pub fn angle_to_short(degrees: f32) -> i32 {
    ((degrees * 65536.0 / 360.0) as i32) & 0xffff
}

fn axis(v: f32) -> i8 {
    (v.clamp(-1.0, 1.0) * 127.0) as i8
}

/// `CL_CreateCmd`.
pub fn build_command(server_time: i32, input: &InputState) -> UserCmd {
    UserCmd {
        server_time,
        angles: [
            angle_to_short(input.view_angles.x),
            angle_to_short(input.view_angles.y),
            angle_to_short(input.view_angles.z),
        ],
        buttons: input.buttons,
        weapon: input.weapon,
        forwardmove: axis(input.forward),
        rightmove: axis(input.right),
        upmove: axis(input.up),
        generic_cmd: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axes_are_clamped_and_angles_wrap() {
        let input = InputState {
            forward: 2.0,
            right: -1.0,
            view_angles: Vec3::new(0.0, 90.0, -90.0),
            ..Default::default()
        };
        let cmd = build_command(1500, &input);
        assert_eq!(cmd.server_time, 1500);
        assert_eq!(cmd.forwardmove, 127);
        assert_eq!(cmd.rightmove, -127);
        assert_eq!(cmd.upmove, 0);
        assert_eq!(cmd.angles, [0, 16384, 49152]);
    }
}
