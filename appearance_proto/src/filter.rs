use serde::{Deserialize, Serialize};

use crate::state::{ColorMatrix, Real, ResourceId, Rgba};

/// Render filter attached to an appearance.
///
/// Filters are plain values: two filters with the same parameters are the
/// same cache key for derived shader instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterState {
    Alpha {
        x: Real,
        y: Real,
        icon: Option<ResourceId>,
        render_source: Option<String>,
        flags: i32,
    },
    AngularBlur {
        x: Real,
        y: Real,
        size: Real,
    },
    Bloom {
        threshold: Rgba,
        size: Real,
        offset: Real,
        alpha: u8,
    },
    Blur {
        size: Real,
    },
    Color {
        matrix: ColorMatrix,
        space: u8,
    },
    Displace {
        x: Real,
        y: Real,
        size: Real,
        icon: Option<ResourceId>,
        render_source: Option<String>,
    },
    DropShadow {
        x: Real,
        y: Real,
        size: Real,
        offset: Real,
        color: Rgba,
    },
    Layer {
        x: Real,
        y: Real,
        icon: Option<ResourceId>,
        render_source: Option<String>,
        flags: i32,
        color: Rgba,
    },
    MotionBlur {
        x: Real,
        y: Real,
    },
    Outline {
        size: Real,
        color: Rgba,
        flags: i32,
    },
    RadialBlur {
        x: Real,
        y: Real,
        size: Real,
    },
    Rays {
        x: Real,
        y: Real,
        size: Real,
        color: Rgba,
        offset: Real,
        density: Real,
        threshold: Real,
        factor: Real,
        flags: i32,
    },
    Ripple {
        x: Real,
        y: Real,
        size: Real,
        repeat: Real,
        radius: Real,
        falloff: Real,
        flags: i32,
    },
    Wave {
        x: Real,
        y: Real,
        size: Real,
        offset: Real,
        flags: i32,
    },
    Greyscale,
}

impl FilterState {
    /// Name of the shader program implementing this filter.
    pub fn kind(&self) -> &'static str {
        match self {
            FilterState::Alpha { .. } => "alpha",
            FilterState::AngularBlur { .. } => "angular_blur",
            FilterState::Bloom { .. } => "bloom",
            FilterState::Blur { .. } => "blur",
            FilterState::Color { .. } => "color",
            FilterState::Displace { .. } => "displace",
            FilterState::DropShadow { .. } => "drop_shadow",
            FilterState::Layer { .. } => "layer",
            FilterState::MotionBlur { .. } => "motion_blur",
            FilterState::Outline { .. } => "outline",
            FilterState::RadialBlur { .. } => "radial_blur",
            FilterState::Rays { .. } => "rays",
            FilterState::Ripple { .. } => "ripple",
            FilterState::Wave { .. } => "wave",
            FilterState::Greyscale => "greyscale",
        }
    }

    pub fn blur(size: f32) -> Self {
        FilterState::Blur { size: Real(size) }
    }

    pub fn outline(size: f32, color: Rgba) -> Self {
        FilterState::Outline {
            size: Real(size),
            color,
            flags: 0,
        }
    }
}
