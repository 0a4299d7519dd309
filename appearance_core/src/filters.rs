//! Per-frame cache of shader instances derived from filter values.
//!
//! Filters are value-equal keys. Every lookup marks its entry used; at the end
//! of a render pass entries nobody asked for are evicted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use appearance_proto::{FilterState, ResourceId, Rgba};
use bevy::prelude::*;
use parking_lot::Mutex;

/// Opaque texture reference owned by the rendering backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

impl TextureHandle {
    pub const TRANSPARENT: TextureHandle = TextureHandle(0);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShaderParam {
    Float(f32),
    Int(i32),
    Color([f32; 4]),
    Matrix4([f32; 16]),
    Vec4([f32; 4]),
    Texture(TextureHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderInstance {
    pub program: &'static str,
    pub params: BTreeMap<&'static str, ShaderParam>,
}

impl ShaderInstance {
    fn new(program: &'static str) -> Self {
        Self {
            program,
            params: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, name: &'static str, value: ShaderParam) {
        self.params.insert(name, value);
    }

    pub fn param(&self, name: &str) -> Option<&ShaderParam> {
        self.params.get(name)
    }
}

pub type SharedShader = Arc<Mutex<ShaderInstance>>;

/// Named render targets available this frame.
pub type RenderSources = HashMap<String, TextureHandle>;

/// Asynchronous icon texture loading, provided by the resource layer.
pub trait IconTextureLoader {
    /// Call `on_loaded` once the texture for `icon` is available. May run
    /// before returning.
    fn load_texture(&self, icon: ResourceId, on_loaded: Box<dyn FnOnce(TextureHandle) + Send>);
}

struct CachedShader {
    shader: SharedShader,
    used: bool,
}

#[derive(Resource, Default)]
pub struct FilterShaderCache {
    entries: HashMap<FilterState, CachedShader>,
}

impl FilterShaderCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, filter: &FilterState) -> bool {
        self.entries.contains_key(filter)
    }

    /// Shader for `filter`, created on first use. Texture parameters are
    /// rebound on every call since render targets change between frames.
    pub fn shader(
        &mut self,
        filter: &FilterState,
        render_sources: &RenderSources,
        loader: &dyn IconTextureLoader,
    ) -> SharedShader {
        let shader = match self.entries.get_mut(filter) {
            Some(entry) => {
                entry.used = true;
                Arc::clone(&entry.shader)
            }
            None => {
                tracing::trace!(target: "appearance::filters", kind = filter.kind(), "shader.created");
                let shader = Arc::new(Mutex::new(instantiate(filter)));
                self.entries.insert(
                    filter.clone(),
                    CachedShader {
                        shader: Arc::clone(&shader),
                        used: true,
                    },
                );
                shader
            }
        };
        bind_textures(filter, &shader, render_sources, loader);
        shader
    }

    /// Clear every usage flag; call at the start of a render pass.
    pub fn reset_usage(&mut self) {
        for entry in self.entries.values_mut() {
            entry.used = false;
        }
    }

    /// Evict entries not looked up since the last reset, then reset the
    /// survivors. Returns the number evicted.
    pub fn sweep_unused(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.used);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::debug!(
                target: "appearance::filters",
                evicted,
                remaining = self.entries.len(),
                "shader_cache.swept"
            );
        }
        self.reset_usage();
        evicted
    }
}

fn color(value: Rgba) -> ShaderParam {
    ShaderParam::Color(value.to_f32_array())
}

fn instantiate(filter: &FilterState) -> ShaderInstance {
    let mut shader = ShaderInstance::new(filter.kind());
    match filter {
        FilterState::Alpha { x, y, flags, .. } => {
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
            shader.set("flags", ShaderParam::Int(*flags));
        }
        FilterState::AngularBlur { x, y, size } | FilterState::RadialBlur { x, y, size } => {
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
            shader.set("size", ShaderParam::Float(size.get()));
        }
        FilterState::Bloom {
            threshold,
            size,
            offset,
            alpha,
        } => {
            shader.set("threshold", color(*threshold));
            shader.set("size", ShaderParam::Float(size.get()));
            shader.set("offset", ShaderParam::Float(offset.get()));
            shader.set("alpha", ShaderParam::Float(*alpha as f32 / 255.0));
        }
        FilterState::Blur { size } => {
            shader.set("size", ShaderParam::Float(size.get()));
        }
        FilterState::Color { matrix, .. } => {
            shader.set("colorMatrix", ShaderParam::Matrix4(matrix.matrix4()));
            shader.set("offsetVector", ShaderParam::Vec4(matrix.offset_vector()));
        }
        FilterState::Displace { x, y, size, .. } => {
            shader.set("size", ShaderParam::Float(size.get()));
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
        }
        FilterState::DropShadow {
            x,
            y,
            size,
            offset,
            color: shadow,
        } => {
            shader.set("size", ShaderParam::Float(size.get()));
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
            shader.set("offset", ShaderParam::Float(offset.get()));
            shader.set("shadow_color", color(*shadow));
        }
        FilterState::Layer {
            x,
            y,
            flags,
            color: tint,
            ..
        } => {
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
            shader.set("flags", ShaderParam::Int(*flags));
            shader.set("color", color(*tint));
        }
        FilterState::MotionBlur { x, y } => {
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
        }
        FilterState::Outline {
            size,
            color: outline,
            flags,
        } => {
            shader.set("size", ShaderParam::Float(size.get()));
            shader.set("color", color(*outline));
            shader.set("flags", ShaderParam::Int(*flags));
        }
        FilterState::Rays {
            x,
            y,
            size,
            color: rays,
            offset,
            density,
            threshold,
            factor,
            flags,
        } => {
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
            shader.set("size", ShaderParam::Float(size.get()));
            shader.set("color", color(*rays));
            shader.set("offset", ShaderParam::Float(offset.get()));
            shader.set("density", ShaderParam::Float(density.get()));
            shader.set("threshold", ShaderParam::Float(threshold.get()));
            shader.set("factor", ShaderParam::Float(factor.get()));
            shader.set("flags", ShaderParam::Int(*flags));
        }
        FilterState::Ripple {
            x,
            y,
            size,
            repeat,
            radius,
            falloff,
            flags,
        } => {
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
            shader.set("size", ShaderParam::Float(size.get()));
            shader.set("repeat", ShaderParam::Float(repeat.get()));
            shader.set("radius", ShaderParam::Float(radius.get()));
            shader.set("falloff", ShaderParam::Float(falloff.get()));
            shader.set("flags", ShaderParam::Int(*flags));
        }
        FilterState::Wave {
            x,
            y,
            size,
            offset,
            flags,
        } => {
            shader.set("x", ShaderParam::Float(x.get()));
            shader.set("y", ShaderParam::Float(y.get()));
            shader.set("size", ShaderParam::Float(size.get()));
            shader.set("offset", ShaderParam::Float(offset.get()));
            shader.set("flags", ShaderParam::Int(*flags));
        }
        FilterState::Greyscale => {}
    }
    shader
}

fn bind_textures(
    filter: &FilterState,
    shader: &SharedShader,
    render_sources: &RenderSources,
    loader: &dyn IconTextureLoader,
) {
    let (param, icon, render_source) = match filter {
        FilterState::Alpha {
            icon,
            render_source,
            ..
        } => ("mask_texture", *icon, render_source.as_deref()),
        FilterState::Displace {
            icon,
            render_source,
            ..
        } => ("displacement_map", *icon, render_source.as_deref()),
        _ => return,
    };

    if let Some(texture) = render_source
        .filter(|name| !name.is_empty())
        .and_then(|name| render_sources.get(name))
    {
        shader.lock().set(param, ShaderParam::Texture(*texture));
        return;
    }

    match icon {
        Some(icon) => {
            let target: Weak<Mutex<ShaderInstance>> = Arc::downgrade(shader);
            loader.load_texture(
                icon,
                Box::new(move |texture: TextureHandle| {
                    if let Some(shader) = target.upgrade() {
                        shader.lock().set(param, ShaderParam::Texture(texture));
                    }
                }),
            );
        }
        None => {
            shader
                .lock()
                .set(param, ShaderParam::Texture(TextureHandle::TRANSPARENT));
        }
    }
}

/// End of a render pass: drop shaders no sprite drew with.
pub fn sweep_filter_shaders(mut cache: ResMut<FilterShaderCache>) {
    cache.sweep_unused();
}

#[cfg(test)]
mod tests {
    use super::*;
    use appearance_proto::Real;

    /// Resolves every icon immediately to a texture numbered after it.
    struct ImmediateLoader;

    impl IconTextureLoader for ImmediateLoader {
        fn load_texture(&self, icon: ResourceId, on_loaded: Box<dyn FnOnce(TextureHandle) + Send>) {
            on_loaded(TextureHandle(1000 + icon.0 as u64));
        }
    }

    /// Holds callbacks until the test releases them.
    #[derive(Default)]
    struct DeferredLoader {
        pending: Mutex<Vec<(ResourceId, Box<dyn FnOnce(TextureHandle) + Send>)>>,
    }

    impl IconTextureLoader for DeferredLoader {
        fn load_texture(&self, icon: ResourceId, on_loaded: Box<dyn FnOnce(TextureHandle) + Send>) {
            self.pending.lock().push((icon, on_loaded));
        }
    }

    impl DeferredLoader {
        fn finish_all(&self) {
            for (icon, on_loaded) in self.pending.lock().drain(..) {
                on_loaded(TextureHandle(icon.0 as u64));
            }
        }
    }

    fn alpha_mask(icon: Option<u32>, render_source: Option<&str>) -> FilterState {
        FilterState::Alpha {
            x: Real::ZERO,
            y: Real::ZERO,
            icon: icon.map(ResourceId),
            render_source: render_source.map(str::to_string),
            flags: 0,
        }
    }

    #[test]
    fn equal_filters_share_one_shader() {
        let mut cache = FilterShaderCache::default();
        let sources = RenderSources::new();
        let first = cache.shader(&FilterState::blur(2.0), &sources, &ImmediateLoader);
        let second = cache.shader(&FilterState::blur(2.0), &sources, &ImmediateLoader);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(first.lock().param("size"), Some(&ShaderParam::Float(2.0)));
        assert_eq!(first.lock().program, "blur");
    }

    #[test]
    fn unused_entries_decay_after_one_pass() {
        let mut cache = FilterShaderCache::default();
        let sources = RenderSources::new();
        let blur = FilterState::blur(1.0);
        let outline = FilterState::outline(1.0, Rgba::BLACK);

        cache.reset_usage();
        cache.shader(&blur, &sources, &ImmediateLoader);
        cache.shader(&outline, &sources, &ImmediateLoader);
        assert_eq!(cache.sweep_unused(), 0);
        assert_eq!(cache.len(), 2);

        cache.shader(&blur, &sources, &ImmediateLoader);
        assert_eq!(cache.sweep_unused(), 1);
        assert!(cache.contains(&blur));
        assert!(!cache.contains(&outline));

        assert_eq!(cache.sweep_unused(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn render_source_wins_over_icon() {
        let mut cache = FilterShaderCache::default();
        let mut sources = RenderSources::new();
        sources.insert("lighting".to_string(), TextureHandle(77));

        let shader = cache.shader(&alpha_mask(Some(5), Some("lighting")), &sources, &ImmediateLoader);
        assert_eq!(
            shader.lock().param("mask_texture"),
            Some(&ShaderParam::Texture(TextureHandle(77)))
        );
    }

    #[test]
    fn missing_render_source_falls_back_to_icon_then_transparent() {
        let mut cache = FilterShaderCache::default();
        let sources = RenderSources::new();

        let from_icon = cache.shader(&alpha_mask(Some(5), Some("gone")), &sources, &ImmediateLoader);
        assert_eq!(
            from_icon.lock().param("mask_texture"),
            Some(&ShaderParam::Texture(TextureHandle(1005)))
        );

        let transparent = cache.shader(&alpha_mask(None, None), &sources, &ImmediateLoader);
        assert_eq!(
            transparent.lock().param("mask_texture"),
            Some(&ShaderParam::Texture(TextureHandle::TRANSPARENT))
        );
    }

    #[test]
    fn textures_rebind_each_lookup() {
        let mut cache = FilterShaderCache::default();
        let filter = FilterState::Displace {
            x: Real::ZERO,
            y: Real::ZERO,
            size: Real(4.0),
            icon: None,
            render_source: Some("water".to_string()),
        };
        let mut sources = RenderSources::new();
        sources.insert("water".to_string(), TextureHandle(1));
        cache.shader(&filter, &sources, &ImmediateLoader);

        sources.insert("water".to_string(), TextureHandle(2));
        let shader = cache.shader(&filter, &sources, &ImmediateLoader);
        assert_eq!(
            shader.lock().param("displacement_map"),
            Some(&ShaderParam::Texture(TextureHandle(2)))
        );
    }

    #[test]
    fn late_texture_binds_if_shader_survives() {
        let mut cache = FilterShaderCache::default();
        let sources = RenderSources::new();
        let loader = DeferredLoader::default();

        let shader = cache.shader(&alpha_mask(Some(9), None), &sources, &loader);
        assert_eq!(shader.lock().param("mask_texture"), None);
        loader.finish_all();
        assert_eq!(
            shader.lock().param("mask_texture"),
            Some(&ShaderParam::Texture(TextureHandle(9)))
        );

        let evicted = alpha_mask(Some(10), None);
        cache.shader(&evicted, &sources, &loader);
        cache.sweep_unused();
        cache.sweep_unused();
        assert!(!cache.contains(&evicted));
        loader.finish_all();
    }
}
