//! Math types.
//!
//! Small and deterministic: no SIMD, no unsafe.

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

pub const PITCH: usize = 0;
pub const YAW: usize = 1;
pub const ROLL: usize = 2;

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn distance_sq(self, other: Self) -> f32 {
        (self - other).len_sq()
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }

    /// Component access by angle index (`PITCH`, `YAW`, `ROLL`).
    pub fn get(self, i: usize) -> f32 {
        match i {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    pub fn set(&mut self, i: usize, v: f32) {
        match i {
            0 => self.x = v,
            1 => self.y = v,
            _ => self.z = v,
        }
    }

    /// Rotates the vector around the Z axis by `degrees`.
    pub fn rotate_z(self, degrees: f32) -> Self {
        let (s, c) = degrees.to_radians().sin_cos();
        Self::new(self.x * c - self.y * s, self.x * s + self.y * c, self.z)
    }

    /// Reads three floats the way `sscanf(s, "%f %f %f")` does: each number
    /// is the longest numeric prefix after optional whitespace, so `"1 2 3x"`
    /// and `"1-2-3"` both yield three components.
    ///
    /// Anything after the third number is ignored; fewer than three is a failure.
    pub fn parse(s: &str) -> Option<Self> {
        let (x, rest) = scan_float(s)?;
        let (y, rest) = scan_float(rest)?;
        let (z, _) = scan_float(rest)?;
        Some(Self::new(x, y, z))
    }

    /// Formats with whole-number precision, the way adjusted spawn values are
    /// written back into entity text.
    pub fn to_rounded_string(self) -> String {
        format!(
            "{} {} {}",
            round_whole(self.x),
            round_whole(self.y),
            round_whole(self.z)
        )
    }
}

/// `%f`: skips leading whitespace, then takes the longest prefix shaped like
/// `[+-]digits[.digits][(e|E)[+-]digits]`.
fn scan_float(s: &str) -> Option<(f32, &str)> {
    let s = s.trim_start();
    let b = s.as_bytes();
    let digits = |mut i: usize| {
        while b.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        i
    };

    let mut end = usize::from(matches!(b.first(), Some(b'+' | b'-')));
    let int_end = digits(end);
    let mut mantissa = int_end > end;
    end = int_end;
    if b.get(end) == Some(&b'.') {
        let frac_end = digits(end + 1);
        mantissa |= frac_end > end + 1;
        end = frac_end;
    }
    if !mantissa {
        return None;
    }
    if matches!(b.get(end), Some(b'e' | b'E')) {
        let sign = usize::from(matches!(b.get(end + 1), Some(b'+' | b'-')));
        let exp_end = digits(end + 1 + sign);
        if exp_end > end + 1 + sign {
            end = exp_end;
        }
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Wraps an angle into `[0, 360)` the way `fmod(a, 360)` does for
/// non-negative input, keeping negative results negative.
pub fn angle_mod(degrees: f32) -> f32 {
    degrees % 360.0
}

/// Rounds to a whole number and drops the sign of zero so that tiny negative
/// residues from trigonometry never print as `-0`.
pub fn round_whole(v: f32) -> String {
    let r = v.round();
    if r == 0.0 {
        "0".to_string()
    } else {
        format!("{r:.0}")
    }
}
