//! Per-viewer appearance visibility.
//!
//! For each viewer, collects the ids a client needs to draw everything within
//! range: every visible sprite's appearance plus its overlay and underlay
//! closure. Viewers are processed in parallel against the shared registry.

use std::collections::{BTreeSet, HashMap};

use appearance_proto::AppearanceId;
use bevy::math::UVec2;
use bevy::prelude::*;
use rayon::prelude::*;

use crate::broadcast::SessionId;
use crate::config::AppearanceConfigHandle;
use crate::registry::ServerAppearanceRegistry;
use crate::sprite::AppearanceSprite;

/// Tile coordinate of an entity.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridPosition(pub UVec2);

/// Marks the entity a session views the world from.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppearanceViewer {
    pub session: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleSprite {
    pub position: UVec2,
    pub appearance: AppearanceId,
}

/// Result of the last visibility pass, per session.
///
/// Read by the session layer to decide which appearances each client needs;
/// the broadcaster itself sends every change to every session.
#[derive(Resource, Debug, Default)]
pub struct AppearanceVisibility {
    per_session: HashMap<SessionId, BTreeSet<AppearanceId>>,
}

impl AppearanceVisibility {
    pub fn visible_to(&self, session: SessionId) -> Option<&BTreeSet<AppearanceId>> {
        self.per_session.get(&session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.per_session.keys().copied()
    }
}

fn within_range(viewer: UVec2, target: UVec2, range: u32) -> bool {
    viewer.x.abs_diff(target.x) <= range && viewer.y.abs_diff(target.y) <= range
}

/// Ids needed by a viewer at `viewer` seeing `range` tiles in every direction.
///
/// Sprites whose appearance is no longer registered are skipped.
pub fn collect_visible_appearances(
    registry: &ServerAppearanceRegistry,
    viewer: UVec2,
    range: u32,
    sprites: &[VisibleSprite],
) -> BTreeSet<AppearanceId> {
    let mut visible = BTreeSet::new();
    for sprite in sprites {
        if !within_range(viewer, sprite.position, range) || visible.contains(&sprite.appearance) {
            continue;
        }
        let Some(root) = registry.try_lookup(sprite.appearance) else {
            continue;
        };

        let mut stack = vec![root];
        while let Some(appearance) = stack.pop() {
            if !visible.insert(appearance.id()) {
                continue;
            }
            stack.extend(appearance.slots().filter_map(|slot| slot.get().cloned()));
        }
    }
    visible
}

/// Visibility for every viewer, computed on the rayon pool.
pub fn compute_visibility(
    registry: &ServerAppearanceRegistry,
    viewers: &[(SessionId, UVec2)],
    range: u32,
    sprites: &[VisibleSprite],
) -> HashMap<SessionId, BTreeSet<AppearanceId>> {
    viewers
        .par_iter()
        .map(|(session, position)| {
            (
                *session,
                collect_visible_appearances(registry, *position, range, sprites),
            )
        })
        .collect()
}

pub fn update_appearance_visibility(
    registry: Res<ServerAppearanceRegistry>,
    config: Res<AppearanceConfigHandle>,
    viewers: Query<(&AppearanceViewer, &GridPosition)>,
    sprites: Query<(&AppearanceSprite, &GridPosition)>,
    mut visibility: ResMut<AppearanceVisibility>,
) {
    let viewers: Vec<(SessionId, UVec2)> = viewers
        .iter()
        .map(|(viewer, position)| (viewer.session, position.0))
        .collect();
    if viewers.is_empty() {
        visibility.per_session.clear();
        return;
    }

    let sprites: Vec<VisibleSprite> = sprites
        .iter()
        .filter_map(|(sprite, position)| {
            sprite.appearance().map(|appearance| VisibleSprite {
                position: position.0,
                appearance: appearance.id(),
            })
        })
        .collect();

    let range = config.get().visibility_range;
    visibility.per_session = compute_visibility(&registry, &viewers, range, &sprites);
    tracing::trace!(
        target: "appearance::registry",
        viewers = viewers.len(),
        sprites = sprites.len(),
        "visibility.computed"
    );
}
