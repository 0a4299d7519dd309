//! Appearance animations: parameters, easing curves and property blending.

use std::f32::consts::PI;
use std::time::Duration;

use appearance_proto::{
    AnimateAppearance, AnimationEasing, AnimationFlags, AppearanceProperties, PixelOffset,
};

/// Timing of one animation step, as requested by game logic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationParams {
    pub duration: Duration,
    pub easing: AnimationEasing,
    /// Number of plays; negative loops forever, zero plays once.
    pub loop_count: i32,
    pub flags: AnimationFlags,
    pub delay_ms: i32,
    /// Queue behind the running animation instead of replacing it.
    pub chain: bool,
}

impl Default for AnimationParams {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(100),
            easing: AnimationEasing::Linear,
            loop_count: 1,
            flags: AnimationFlags::empty(),
            delay_ms: 0,
            chain: false,
        }
    }
}

impl AnimationParams {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.max(0) as u64)
    }

    /// Number of plays, `None` for infinite.
    pub fn plays(&self) -> Option<u32> {
        match self.loop_count {
            count if count < 0 => None,
            0 => Some(1),
            count => Some(count as u32),
        }
    }

    /// Total running time after the delay. `None` for infinite loops and for
    /// running times too long to represent, which never finish either.
    pub fn total(&self) -> Option<Duration> {
        self.plays().and_then(|plays| self.duration.checked_mul(plays))
    }
}

impl From<&AnimateAppearance> for AnimationParams {
    fn from(message: &AnimateAppearance) -> Self {
        Self {
            duration: message.duration,
            easing: message.easing,
            loop_count: message.loop_count,
            flags: message.flags,
            delay_ms: message.delay_ms,
            chain: message.chain,
        }
    }
}

/// Map linear progress `t` in `[0, 1]` through the easing curve.
///
/// `EASE_IN` alone applies the curve at the start, `EASE_OUT` alone at the
/// end; neither or both applies it at both ends.
pub fn ease(easing: AnimationEasing, flags: AnimationFlags, t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    let ease_in = flags.contains(AnimationFlags::EASE_IN);
    let ease_out = flags.contains(AnimationFlags::EASE_OUT);

    if easing == AnimationEasing::Jump {
        return match (ease_in, ease_out) {
            (true, false) => {
                if t >= 1.0 {
                    1.0
                } else {
                    0.0
                }
            }
            (false, true) => {
                if t > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            _ => {
                if t >= 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
        };
    }

    match (ease_in, ease_out) {
        (true, false) => curve_in(easing, t),
        (false, true) => 1.0 - curve_in(easing, 1.0 - t),
        _ => {
            if t < 0.5 {
                curve_in(easing, 2.0 * t) / 2.0
            } else {
                1.0 - curve_in(easing, 2.0 - 2.0 * t) / 2.0
            }
        }
    }
}

fn curve_in(easing: AnimationEasing, t: f32) -> f32 {
    match easing {
        AnimationEasing::Linear | AnimationEasing::Jump => t,
        AnimationEasing::Sine => 1.0 - (t * PI / 2.0).cos(),
        AnimationEasing::Circular => 1.0 - (1.0 - t * t).max(0.0).sqrt(),
        AnimationEasing::Cubic => t * t * t,
        AnimationEasing::Quad => t * t,
        AnimationEasing::Back => {
            const C1: f32 = 1.70158;
            const C3: f32 = C1 + 1.0;
            C3 * t * t * t - C1 * t * t
        }
        AnimationEasing::Elastic => {
            if t <= 0.0 {
                0.0
            } else if t >= 1.0 {
                1.0
            } else {
                let c4 = 2.0 * PI / 3.0;
                -(2f32.powf(10.0 * t - 10.0)) * ((t * 10.0 - 10.75) * c4).sin()
            }
        }
        AnimationEasing::Bounce => 1.0 - bounce_out(1.0 - t),
    }
}

fn bounce_out(t: f32) -> f32 {
    const N1: f32 = 7.5625;
    const D1: f32 = 2.75;
    if t < 1.0 / D1 {
        N1 * t * t
    } else if t < 2.0 / D1 {
        let t = t - 1.5 / D1;
        N1 * t * t + 0.75
    } else if t < 2.5 / D1 {
        let t = t - 2.25 / D1;
        N1 * t * t + 0.9375
    } else {
        let t = t - 2.625 / D1;
        N1 * t * t + 0.984375
    }
}

/// Blend two property sets. Alpha, color and pixel offset interpolate; every
/// other field takes the target's value for the whole animation.
pub fn interpolate(
    from: &AppearanceProperties,
    to: &AppearanceProperties,
    factor: f32,
) -> AppearanceProperties {
    let mut blended = to.clone();
    blended.alpha = lerp_u8(from.alpha, to.alpha, factor);
    blended.color = from.color.lerp(to.color, factor);
    blended.pixel_offset = PixelOffset::new(
        lerp_i32(from.pixel_offset.x, to.pixel_offset.x, factor),
        lerp_i32(from.pixel_offset.y, to.pixel_offset.y, factor),
    );
    blended
}

fn lerp_u8(from: u8, to: u8, factor: f32) -> u8 {
    let value = from as f32 + (to as f32 - from as f32) * factor;
    value.round().clamp(0.0, 255.0) as u8
}

fn lerp_i32(from: i32, to: i32, factor: f32) -> i32 {
    (from as f32 + (to as f32 - from as f32) * factor).round() as i32
}
