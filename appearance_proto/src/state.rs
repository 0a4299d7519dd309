use std::fmt;
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::filter::FilterState;
use crate::hashing::content_hash;

/// Content-addressed identifier of a canonical appearance.
///
/// The value is the FNV-1a hash of the appearance's [`AppearanceState`], so a
/// client can recompute it locally and compare against the id it was sent.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AppearanceId(pub u64);

impl fmt::Display for AppearanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of an icon resource owned by the external resource loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u32);

/// `f32` compared and hashed by bit pattern.
///
/// Canonical appearances must be usable as map keys, and two values that
/// encode to the same bytes on the wire must compare equal.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Real(pub f32);

impl Real {
    pub const ZERO: Real = Real(0.0);
    pub const ONE: Real = Real(1.0);

    pub fn get(self) -> f32 {
        self.0
    }
}

impl From<f32> for Real {
    fn from(value: f32) -> Self {
        Real(value)
    }
}

impl PartialEq for Real {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Real {}

impl Hash for Real {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0.to_bits());
    }
}

/// Facing of an icon, using the classic eight-way bit encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    North = 1,
    #[default]
    South = 2,
    East = 4,
    West = 8,
    NorthEast = 5,
    NorthWest = 9,
    SouthEast = 6,
    SouthWest = 10,
}

impl Direction {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the bit encoding, defaulting to South for invalid values.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::North,
            4 => Self::East,
            8 => Self::West,
            5 => Self::NorthEast,
            9 => Self::NorthWest,
            6 => Self::SouthEast,
            10 => Self::SouthWest,
            _ => Self::South,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::new(255, 255, 255, 255);
    pub const BLACK: Rgba = Rgba::new(0, 0, 0, 255);
    pub const TRANSPARENT: Rgba = Rgba::new(0, 0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Normalized `[r, g, b, a]` for shader parameters.
    pub fn to_f32_array(self) -> [f32; 4] {
        [
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
            self.a as f32 / 255.0,
        ]
    }

    pub fn lerp(self, other: Rgba, factor: f32) -> Rgba {
        let mix = |from: u8, to: u8| -> u8 {
            let value = from as f32 + (to as f32 - from as f32) * factor;
            value.round().clamp(0.0, 255.0) as u8
        };
        Rgba::new(
            mix(self.r, other.r),
            mix(self.g, other.g),
            mix(self.b, other.b),
            mix(self.a, other.a),
        )
    }
}

impl Default for Rgba {
    fn default() -> Self {
        Rgba::WHITE
    }
}

/// 4x5 color matrix laid out row by row: `rr rg rb ra`, `gr gg gb ga`,
/// `br bg bb ba`, `ar ag ab aa`, then the constant row `cr cg cb ca`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorMatrix(pub [Real; 20]);

impl ColorMatrix {
    pub fn identity() -> Self {
        let mut values = [Real::ZERO; 20];
        for diagonal in 0..4 {
            values[diagonal * 5] = Real::ONE;
        }
        ColorMatrix(values)
    }

    /// The 4x4 part, row major.
    pub fn matrix4(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for (slot, value) in out.iter_mut().zip(self.0.iter()) {
            *slot = value.get();
        }
        out
    }

    /// The constant row, applied after the 4x4 multiply.
    pub fn offset_vector(&self) -> [f32; 4] {
        [
            self.0[16].get(),
            self.0[17].get(),
            self.0[18].get(),
            self.0[19].get(),
        ]
    }
}

impl Default for ColorMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PixelOffset {
    pub x: i32,
    pub y: i32,
}

impl PixelOffset {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

bitflags! {
    /// Rendering behaviour flags carried by an appearance.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AppearanceFlags: u16 {
        const LONG_GLIDE = 1 << 0;
        const RESET_COLOR = 1 << 1;
        const RESET_ALPHA = 1 << 2;
        const RESET_TRANSFORM = 1 << 3;
        const NO_CLIENT_COLOR = 1 << 4;
        const KEEP_TOGETHER = 1 << 5;
        const KEEP_APART = 1 << 6;
        const PLANE_MASTER = 1 << 7;
        const TILE_BOUND = 1 << 8;
        const PIXEL_SCALE = 1 << 9;
        const PASS_MOUSE = 1 << 10;
        const TILE_MOVER = 1 << 11;
    }
}

/// Every visual field of an appearance except its overlay lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppearanceProperties {
    pub icon: Option<ResourceId>,
    pub icon_state: Option<String>,
    pub direction: Direction,
    pub layer: Real,
    pub plane: i16,
    pub pixel_offset: PixelOffset,
    pub color: Rgba,
    pub color_matrix: Option<ColorMatrix>,
    pub alpha: u8,
    pub flags: AppearanceFlags,
    pub filters: Vec<FilterState>,
}

impl Default for AppearanceProperties {
    fn default() -> Self {
        Self {
            icon: None,
            icon_state: None,
            direction: Direction::South,
            layer: Real::ZERO,
            plane: 0,
            pixel_offset: PixelOffset::default(),
            color: Rgba::WHITE,
            color_matrix: None,
            alpha: 255,
            flags: AppearanceFlags::empty(),
            filters: Vec::new(),
        }
    }
}

/// Wire form of a canonical appearance: overlays and underlays are referenced
/// by id, in draw order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppearanceState {
    pub properties: AppearanceProperties,
    pub overlays: Vec<AppearanceId>,
    pub underlays: Vec<AppearanceId>,
}

impl AppearanceState {
    pub fn content_hash(&self) -> AppearanceId {
        content_hash(self)
    }

    /// Overlay ids followed by underlay ids.
    pub fn referenced_ids(&self) -> impl Iterator<Item = AppearanceId> + '_ {
        self.overlays.iter().chain(self.underlays.iter()).copied()
    }
}
