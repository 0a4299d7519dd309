//! Sprites: the server component that owns an appearance handle, and the
//! client-side icon that renders a resolved appearance and its animations.

use std::collections::VecDeque;
use std::time::Duration;

use appearance_proto::{AppearanceId, AppearanceProperties, ResourceId};
use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::animation::{ease, interpolate, AnimationParams};
use crate::appearance::{Appearance, AppearanceError, AppearanceRef, CanonicalAppearance};
use crate::registry::ServerAppearanceRegistry;

/// Turf ids are appearance ids shifted by one so that zero means "no turf".
pub fn turf_id_for(appearance: AppearanceId) -> u64 {
    appearance.0.wrapping_add(1)
}

pub fn appearance_for_turf(turf_id: u64) -> AppearanceId {
    AppearanceId(turf_id.wrapping_sub(1))
}

/// Placement of a sprite on the HUD instead of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScreenLocation {
    pub x: i32,
    pub y: i32,
    pub pixel_x: i32,
    pub pixel_y: i32,
}

/// Replicated form of [`AppearanceSprite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpriteState {
    pub appearance: Option<AppearanceId>,
    pub screen_location: Option<ScreenLocation>,
}

/// Server sprite. Holding the handle keeps the appearance registered.
#[derive(Component, Debug, Default, Clone)]
pub struct AppearanceSprite {
    appearance: Option<AppearanceRef>,
    screen_location: Option<ScreenLocation>,
}

impl AppearanceSprite {
    pub fn appearance(&self) -> Option<&AppearanceRef> {
        self.appearance.as_ref()
    }

    pub fn screen_location(&self) -> Option<ScreenLocation> {
        self.screen_location
    }

    /// Intern `appearance` and hold it; the previous handle is released.
    pub fn set_appearance(
        &mut self,
        registry: &ServerAppearanceRegistry,
        appearance: &Appearance,
    ) -> Result<(), AppearanceError> {
        self.appearance = Some(registry.intern(appearance)?);
        Ok(())
    }

    pub fn clear_appearance(&mut self) {
        self.appearance = None;
    }

    pub fn set_screen_location(&mut self, screen_location: Option<ScreenLocation>) {
        self.screen_location = screen_location;
    }

    pub fn state(&self) -> SpriteState {
        SpriteState {
            appearance: self.appearance.as_ref().map(|appearance| appearance.id()),
            screen_location: self.screen_location,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveAnimation {
    from: AppearanceProperties,
    target: AppearanceRef,
    params: AnimationParams,
    /// When interpolation begins, after the delay.
    start: Duration,
}

impl ActiveAnimation {
    fn end(&self) -> Option<Duration> {
        self.params.total().and_then(|total| self.start.checked_add(total))
    }

    fn finished(&self, now: Duration) -> bool {
        self.end().map(|end| now >= end).unwrap_or(false)
    }

    fn properties_at(&self, now: Duration) -> AppearanceProperties {
        if now < self.start {
            return self.from.clone();
        }
        let duration = self.params.duration.as_nanos();
        let progress = if duration == 0 || self.finished(now) {
            1.0
        } else {
            let played = (now - self.start).as_nanos() % duration;
            played as f32 / duration as f32
        };
        let factor = ease(self.params.easing, self.params.flags, progress);
        interpolate(&self.from, self.target.properties(), factor)
    }
}

/// Client-side renderable for an entity or turf.
#[derive(Debug, Default, Clone)]
pub struct SpriteIcon {
    appearance: Option<AppearanceRef>,
    animations: VecDeque<ActiveAnimation>,
}

impl SpriteIcon {
    pub fn appearance(&self) -> Option<&AppearanceRef> {
        self.appearance.as_ref()
    }

    pub fn set_appearance(&mut self, appearance: AppearanceRef) {
        self.appearance = Some(appearance);
    }

    pub fn is_animating(&self) -> bool {
        !self.animations.is_empty()
    }

    /// Start animating towards `target`.
    ///
    /// A chained animation begins when the last queued one ends; otherwise
    /// the queue is replaced and the new animation starts from whatever is
    /// visible at `now`.
    pub fn start_animation(&mut self, target: AppearanceRef, params: AnimationParams, now: Duration) {
        if params.chain {
            if let Some(last) = self.animations.back() {
                let begin = last.end().unwrap_or(now).max(now);
                let from = last.target.properties().clone();
                self.animations.push_back(ActiveAnimation {
                    from,
                    target,
                    params,
                    start: begin.saturating_add(params.delay()),
                });
                return;
            }
        }

        let from = self.properties_at(now).unwrap_or_default();
        self.animations.clear();
        self.animations.push_back(ActiveAnimation {
            from,
            target,
            params,
            start: now.saturating_add(params.delay()),
        });
    }

    /// Properties to draw at `now`. Finished animations commit their target
    /// as the icon's appearance.
    pub fn properties_at(&mut self, now: Duration) -> Option<AppearanceProperties> {
        while self
            .animations
            .front()
            .map(|animation| animation.finished(now))
            .unwrap_or(false)
        {
            if let Some(done) = self.animations.pop_front() {
                self.appearance = Some(done.target);
            }
        }

        if let Some(animation) = self.animations.front() {
            return Some(animation.properties_at(now));
        }
        self.appearance
            .as_ref()
            .map(|appearance| appearance.properties().clone())
    }

    /// World-space bounds of the icon and every resolved overlay and
    /// underlay, in tiles.
    ///
    /// `icon_size` reports the pixel dimensions of an icon resource; icons it
    /// does not know yet are skipped.
    pub fn world_bounds<F>(&self, world_position: Vec2, tile_size: u32, icon_size: F) -> Option<Rect>
    where
        F: Fn(ResourceId) -> Option<UVec2>,
    {
        let appearance = self.appearance.as_ref()?;
        appearance_bounds(appearance, world_position, tile_size.max(1) as f32, &icon_size)
    }
}

fn appearance_bounds<F>(
    appearance: &CanonicalAppearance,
    origin: Vec2,
    tile_size: f32,
    icon_size: &F,
) -> Option<Rect>
where
    F: Fn(ResourceId) -> Option<UVec2>,
{
    let offset = appearance.properties().pixel_offset;
    let origin = origin + Vec2::new(offset.x as f32, offset.y as f32) / tile_size;

    let mut bounds = appearance
        .properties()
        .icon
        .and_then(icon_size)
        .map(|size| Rect::from_corners(origin, origin + size.as_vec2() / tile_size));

    for slot in appearance.slots() {
        let Some(overlay) = slot.get() else {
            continue;
        };
        if let Some(child) = appearance_bounds(overlay, origin, tile_size, icon_size) {
            bounds = Some(match bounds {
                Some(current) => current.union(child),
                None => child,
            });
        }
    }
    bounds
}

/// Client sprite component.
#[derive(Component, Debug, Default, Clone)]
pub struct ClientSprite {
    pub icon: SpriteIcon,
}
