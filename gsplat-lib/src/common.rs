/// Spherical harmonics DC term, used to turn `f_dc_*` coefficients into a base color.
pub const SH_C0: f32 = 0.282_094_791_773_878_14;

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub(crate) fn quat_norm(q: (f32, f32, f32, f32)) -> f32 {
    (q.0 * q.0 + q.1 * q.1 + q.2 * q.2 + q.3 * q.3).sqrt()
}

/// Packs one normalized quaternion component into the canonical `c*128+128` byte encoding.
#[inline]
pub(crate) fn pack_quat_component(c: f32) -> u8 {
    clamp_u8(c * 128.0 + 128.0)
}
