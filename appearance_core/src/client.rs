//! Client-side mirror of the server's appearance registry.
//!
//! Messages may reference ids whose definition has not arrived yet. Anything
//! that needs such an id registers a load callback, which runs once the
//! definition is inserted.

use std::collections::HashMap;
use std::sync::Arc;

use appearance_proto::{
    AnimateAppearance, AnimationTarget, AppearanceAdded, AppearanceId, AppearanceMessage,
    AppearanceRemoved, AppearanceSnapshot, AppearanceState, ResourceId,
};
use bevy::prelude::*;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::animation::AnimationParams;
use crate::appearance::{Appearance, AppearanceError, AppearanceRef, CanonicalAppearance};
use crate::sprite::{appearance_for_turf, ClientSprite, SpriteIcon};

/// Runs once with the appearance it was registered for.
pub type LoadCallback = Box<dyn FnOnce(&AppearanceRef) + Send + Sync>;

const DEFAULT_PENDING_WARN_THRESHOLD: usize = 1024;
const DEFAULT_TILE_SIZE: u32 = 32;

/// Work produced by load callbacks for the ECS side to apply.
#[derive(Debug, Clone)]
pub enum IconUpdate {
    Appearance {
        target: AnimationTarget,
        appearance: AppearanceRef,
    },
    Animation {
        target: AnimationTarget,
        appearance: AppearanceRef,
        params: AnimationParams,
    },
}

/// Messages arriving from the server session.
#[derive(Resource)]
pub struct AppearanceInbox(pub Receiver<AppearanceMessage>);

#[derive(Resource)]
pub struct ClientAppearanceCache {
    appearances: HashMap<AppearanceId, AppearanceRef>,
    mutable_cache: HashMap<AppearanceId, Arc<Appearance>>,
    load_callbacks: HashMap<AppearanceId, Vec<LoadCallback>>,
    turf_icons: HashMap<u64, SpriteIcon>,
    tile_size: u32,
    icon_updates_tx: Sender<IconUpdate>,
    icon_updates_rx: Receiver<IconUpdate>,
    pending_warn_threshold: usize,
}

impl Default for ClientAppearanceCache {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_WARN_THRESHOLD)
    }
}

impl ClientAppearanceCache {
    pub fn new(pending_warn_threshold: usize) -> Self {
        let (icon_updates_tx, icon_updates_rx) = unbounded();
        Self {
            appearances: HashMap::new(),
            mutable_cache: HashMap::new(),
            load_callbacks: HashMap::new(),
            turf_icons: HashMap::new(),
            tile_size: DEFAULT_TILE_SIZE,
            icon_updates_tx,
            icon_updates_rx,
            pending_warn_threshold: pending_warn_threshold.max(1),
        }
    }

    /// Pixels per world tile, used to place icons in world space.
    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size.max(1);
        self
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn len(&self) -> usize {
        self.appearances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appearances.is_empty()
    }

    /// Total callbacks waiting on ids that have not arrived.
    pub fn pending_callbacks(&self) -> usize {
        self.load_callbacks.values().map(Vec::len).sum()
    }

    pub fn get(&self, id: AppearanceId) -> Option<&AppearanceRef> {
        self.appearances.get(&id)
    }

    /// # Panics
    ///
    /// Panics if `id` has not been received. Use [`load`](Self::load) for ids
    /// that may still be in flight.
    pub fn must_get(&self, id: AppearanceId) -> &AppearanceRef {
        match self.appearances.get(&id) {
            Some(appearance) => appearance,
            None => panic!("appearance {id} has not been received"),
        }
    }

    /// Run `callback` with the appearance for `id`, now if it is known or
    /// when it arrives. Callbacks for one id run in registration order.
    pub fn load(&mut self, id: AppearanceId, callback: LoadCallback) {
        match self.appearances.get(&id).cloned() {
            Some(appearance) => callback(&appearance),
            None => self.push_callback(id, callback),
        }
    }

    fn push_callback(&mut self, id: AppearanceId, callback: LoadCallback) {
        let pending = self.load_callbacks.entry(id).or_default();
        pending.push(callback);
        if pending.len() == self.pending_warn_threshold {
            tracing::warn!(
                target: "appearance::client",
                %id,
                pending = pending.len(),
                "load_callbacks.backlog=threshold_reached"
            );
        }
    }

    /// Store an appearance received from the server and run everything that
    /// was waiting for it.
    ///
    /// A state whose content hash is not `id` is dropped with a warning.
    pub fn insert(&mut self, id: AppearanceId, state: AppearanceState) {
        let Some(appearance) = self.store(id, state) else {
            return;
        };
        self.link_overlays(&appearance);
        self.drain_callbacks(id, &appearance);
    }

    /// Replace the mirror with a full snapshot.
    ///
    /// Every entry is stored before any overlay link is made, so entries may
    /// reference each other in any order.
    pub fn apply_snapshot(&mut self, snapshot: AppearanceSnapshot) {
        self.appearances.clear();
        self.mutable_cache.clear();

        let count = snapshot.len();
        let stored: Vec<(AppearanceId, AppearanceRef)> = snapshot
            .appearances
            .into_iter()
            .filter_map(|(id, state)| self.store(id, state).map(|appearance| (id, appearance)))
            .collect();
        for (_, appearance) in &stored {
            self.link_overlays(appearance);
        }
        for (id, appearance) in &stored {
            self.drain_callbacks(*id, appearance);
        }
        tracing::debug!(target: "appearance::client", appearances = count, "snapshot.applied");
    }

    /// Drop a mirrored appearance. Unknown ids are ignored; callbacks still
    /// waiting on the id stay registered.
    pub fn remove(&mut self, id: AppearanceId) {
        self.mutable_cache.remove(&id);
        if self.appearances.remove(&id).is_none() {
            tracing::debug!(target: "appearance::client", %id, "remove.ignored=unknown_id");
        }
    }

    /// Editable copy of `id`, memoized and shared by reference. Clone it
    /// before mutating.
    ///
    /// Returns `None` when the id is unknown or an overlay has not arrived.
    pub fn shared_mutable_snapshot(&mut self, id: AppearanceId) -> Option<Arc<Appearance>> {
        if let Some(cached) = self.mutable_cache.get(&id) {
            return Some(Arc::clone(cached));
        }
        let appearance = self.appearances.get(&id)?;
        match appearance.to_mutable() {
            Ok(mutable) => {
                let mutable = Arc::new(mutable);
                self.mutable_cache.insert(id, Arc::clone(&mutable));
                Some(mutable)
            }
            Err(AppearanceError::UnresolvedOverlay(overlay)) => {
                tracing::debug!(
                    target: "appearance::client",
                    %id,
                    %overlay,
                    "mutable_snapshot.deferred=unresolved_overlay"
                );
                None
            }
            Err(err) => {
                tracing::warn!(target: "appearance::client", %id, error = %err, "mutable_snapshot.failed");
                None
            }
        }
    }

    pub fn apply_message(&mut self, message: AppearanceMessage) {
        match message {
            AppearanceMessage::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            AppearanceMessage::Added(AppearanceAdded { id, appearance }) => {
                self.insert(id, appearance)
            }
            AppearanceMessage::Removed(AppearanceRemoved { id }) => self.remove(id),
            AppearanceMessage::Animate(animation) => self.queue_animation(&animation),
        }
    }

    fn queue_animation(&mut self, animation: &AnimateAppearance) {
        let params = AnimationParams::from(animation);
        let target = animation.target;
        let updates = self.icon_updates_tx.clone();
        self.load(
            animation.target_appearance,
            Box::new(move |appearance: &AppearanceRef| {
                let _ = updates.send(IconUpdate::Animation {
                    target,
                    appearance: Arc::clone(appearance),
                    params,
                });
            }),
        );
    }

    /// Point an entity's sprite at `id` once it is available.
    pub fn bind_sprite(&mut self, entity: Entity, id: AppearanceId) {
        let updates = self.icon_updates_tx.clone();
        let target = AnimationTarget::Entity(entity.to_bits());
        self.load(
            id,
            Box::new(move |appearance: &AppearanceRef| {
                let _ = updates.send(IconUpdate::Appearance {
                    target,
                    appearance: Arc::clone(appearance),
                });
            }),
        );
    }

    /// Icon for a turf, created on first use. The turf's appearance is
    /// `turf_id - 1`.
    pub fn turf_icon(&mut self, turf_id: u64) -> &mut SpriteIcon {
        if !self.turf_icons.contains_key(&turf_id) {
            let id = appearance_for_turf(turf_id);
            let mut icon = SpriteIcon::default();
            match self.appearances.get(&id) {
                Some(appearance) => icon.set_appearance(Arc::clone(appearance)),
                None => {
                    let updates = self.icon_updates_tx.clone();
                    self.push_callback(
                        id,
                        Box::new(move |appearance: &AppearanceRef| {
                            let _ = updates.send(IconUpdate::Appearance {
                                target: AnimationTarget::Turf(turf_id),
                                appearance: Arc::clone(appearance),
                            });
                        }),
                    );
                }
            }
            self.turf_icons.insert(turf_id, icon);
        }
        self.turf_icons.entry(turf_id).or_default()
    }

    pub fn existing_turf_icon(&mut self, turf_id: u64) -> Option<&mut SpriteIcon> {
        self.turf_icons.get_mut(&turf_id)
    }

    /// World-space bounds of a turf icon drawn at `world_position`.
    pub fn turf_bounds<F>(&self, turf_id: u64, world_position: Vec2, icon_size: F) -> Option<Rect>
    where
        F: Fn(ResourceId) -> Option<UVec2>,
    {
        self.turf_icons
            .get(&turf_id)?
            .world_bounds(world_position, self.tile_size, icon_size)
    }

    pub fn drain_icon_updates(&self) -> Vec<IconUpdate> {
        self.icon_updates_rx.try_iter().collect()
    }

    fn store(&mut self, id: AppearanceId, state: AppearanceState) -> Option<AppearanceRef> {
        let appearance = Arc::new(CanonicalAppearance::from_state(state));
        if appearance.id() != id {
            let error = AppearanceError::ContentHashMismatch {
                id,
                actual: appearance.id(),
            };
            tracing::warn!(target: "appearance::client", error = %error, "insert.rejected");
            return None;
        }
        self.mutable_cache.remove(&id);
        if self.appearances.insert(id, Arc::clone(&appearance)).is_some() {
            tracing::debug!(target: "appearance::client", %id, "insert.duplicate=overwritten");
        }
        Some(appearance)
    }

    // Stored ids are content hashes, so a slot can never point back at an
    // ancestor.
    fn link_overlays(&mut self, appearance: &AppearanceRef) {
        for (index, slot) in appearance.slots().enumerate() {
            if slot.is_resolved() {
                continue;
            }
            let overlay_id = slot.id();
            match self.appearances.get(&overlay_id).cloned() {
                Some(overlay) => {
                    slot.resolve(overlay);
                }
                None => {
                    let parent = Arc::downgrade(appearance);
                    self.push_callback(
                        overlay_id,
                        Box::new(move |overlay: &AppearanceRef| {
                            let Some(parent) = parent.upgrade() else {
                                return;
                            };
                            if let Some(slot) = parent.slot_at(index) {
                                slot.resolve(Arc::clone(overlay));
                            }
                        }),
                    );
                }
            }
        }
    }

    fn drain_callbacks(&mut self, id: AppearanceId, appearance: &AppearanceRef) {
        let Some(callbacks) = self.load_callbacks.remove(&id) else {
            return;
        };
        tracing::trace!(target: "appearance::client", %id, callbacks = callbacks.len(), "load_callbacks.drained");
        for callback in callbacks {
            callback(appearance);
        }
    }
}

/// Apply every message the session delivered since the last tick.
pub fn receive_appearance_messages(
    inbox: Res<AppearanceInbox>,
    mut cache: ResMut<ClientAppearanceCache>,
) {
    for message in inbox.0.try_iter() {
        cache.apply_message(message);
    }
}

/// Route icon updates produced by load callbacks to sprites and turf icons.
///
/// Updates for entities without a [`ClientSprite`] and for turfs whose icon
/// was never requested are dropped.
pub fn apply_icon_updates(
    mut cache: ResMut<ClientAppearanceCache>,
    time: Res<Time>,
    mut sprites: Query<&mut ClientSprite>,
) {
    let now = time.elapsed();
    for update in cache.drain_icon_updates() {
        let (target, apply): (AnimationTarget, Box<dyn FnOnce(&mut SpriteIcon)>) = match update {
            IconUpdate::Appearance { target, appearance } => {
                (target, Box::new(move |icon: &mut SpriteIcon| icon.set_appearance(appearance)))
            }
            IconUpdate::Animation {
                target,
                appearance,
                params,
            } => (
                target,
                Box::new(move |icon: &mut SpriteIcon| icon.start_animation(appearance, params, now)),
            ),
        };

        match target {
            AnimationTarget::Entity(bits) => {
                let Ok(entity) = Entity::try_from_bits(bits) else {
                    tracing::debug!(target: "appearance::client", bits, "icon_update.dropped=invalid_entity");
                    continue;
                };
                if let Ok(mut sprite) = sprites.get_mut(entity) {
                    apply(&mut sprite.icon);
                }
            }
            AnimationTarget::Turf(turf_id) => {
                if let Some(icon) = cache.existing_turf_icon(turf_id) {
                    apply(icon);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::canonicalize;
    use crate::sprite::turf_id_for;
    use appearance_proto::{AnimationEasing, AnimationFlags};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn state_of(appearance: &Appearance) -> (AppearanceId, AppearanceState) {
        let canonical = canonicalize(appearance).expect("canonical");
        (canonical.id(), canonical.to_state())
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> LoadCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |tag: u32| -> LoadCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |_: &AppearanceRef| sink.lock().push(tag))
        };
        (log, make)
    }

    #[test]
    fn load_runs_immediately_when_present() {
        let mut cache = ClientAppearanceCache::default();
        let (id, state) = state_of(&Appearance::with_icon(ResourceId(1), "lamp"));
        cache.insert(id, state);

        let (log, make) = recorder();
        cache.load(id, make(7));
        assert_eq!(*log.lock(), vec![7]);
        assert_eq!(cache.pending_callbacks(), 0);
    }

    #[test]
    fn deferred_callbacks_fire_once_in_order() {
        let mut cache = ClientAppearanceCache::default();
        let (id, state) = state_of(&Appearance::with_icon(ResourceId(1), "lamp"));

        let (log, make) = recorder();
        cache.load(id, make(1));
        cache.load(id, make(2));
        assert!(log.lock().is_empty());
        assert_eq!(cache.pending_callbacks(), 2);

        cache.insert(id, state.clone());
        assert_eq!(*log.lock(), vec![1, 2]);

        cache.insert(id, state);
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(cache.pending_callbacks(), 0);
    }

    #[test]
    fn overlay_arriving_later_resolves_parent() {
        let mut cache = ClientAppearanceCache::default();
        let hat = Appearance::with_icon(ResourceId(2), "hat");
        let body = Appearance::with_icon(ResourceId(1), "body").with_overlay(hat.clone());
        let (body_id, body_state) = state_of(&body);
        let (hat_id, hat_state) = state_of(&hat);

        cache.insert(body_id, body_state);
        assert!(!cache.must_get(body_id).is_fully_resolved());
        assert!(cache.shared_mutable_snapshot(body_id).is_none());

        cache.insert(hat_id, hat_state);
        assert!(cache.must_get(body_id).is_fully_resolved());
        let mutable = cache.shared_mutable_snapshot(body_id).expect("resolved");
        assert_eq!(*mutable, body);
    }

    #[test]
    fn snapshot_resolves_forward_references() {
        let leaf = Appearance::with_icon(ResourceId(3), "leaf");
        let branch = Appearance::with_icon(ResourceId(2), "branch").with_underlay(leaf.clone());
        let tree = Appearance::with_icon(ResourceId(1), "tree").with_overlay(branch.clone());

        let appearances: BTreeMap<_, _> = [&leaf, &branch, &tree].into_iter().map(state_of).collect();
        let (tree_id, _) = state_of(&tree);

        let mut cache = ClientAppearanceCache::default();
        let (stale_id, stale_state) = state_of(&Appearance::with_icon(ResourceId(9), "stale"));
        cache.insert(stale_id, stale_state);

        cache.apply_snapshot(AppearanceSnapshot { appearances });
        assert_eq!(cache.len(), 3);
        assert!(cache.get(stale_id).is_none());
        assert!(cache.must_get(tree_id).is_fully_resolved());
        assert_eq!(cache.pending_callbacks(), 0);
    }

    #[test]
    fn remove_is_a_noop_for_unknown_ids() {
        let mut cache = ClientAppearanceCache::default();
        let (id, state) = state_of(&Appearance::with_icon(ResourceId(1), "lamp"));
        cache.remove(id);

        cache.insert(id, state);
        cache.remove(id);
        assert!(cache.get(id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    #[should_panic(expected = "has not been received")]
    fn must_get_panics_on_unknown_id() {
        let cache = ClientAppearanceCache::default();
        cache.must_get(AppearanceId(42));
    }

    #[test]
    fn mutable_snapshot_is_memoized_until_overwritten() {
        let mut cache = ClientAppearanceCache::default();
        let (id, state) = state_of(&Appearance::with_icon(ResourceId(1), "lamp"));
        cache.insert(id, state.clone());

        let first = cache.shared_mutable_snapshot(id).expect("known");
        let second = cache.shared_mutable_snapshot(id).expect("known");
        assert!(Arc::ptr_eq(&first, &second));

        cache.insert(id, state);
        let third = cache.shared_mutable_snapshot(id).expect("known");
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first, third);
    }

    #[test]
    fn state_under_foreign_id_is_rejected() {
        let mut cache = ClientAppearanceCache::default();
        let forged = AppearanceId(0xabc);
        cache.insert(forged, AppearanceState::default());
        assert!(cache.get(forged).is_none());
        assert!(cache.is_empty());

        let parent = AppearanceState {
            overlays: vec![forged],
            ..AppearanceState::default()
        };
        let parent_id = parent.content_hash();
        cache.insert(parent_id, parent);
        assert!(!cache.must_get(parent_id).is_fully_resolved());
        assert_eq!(cache.pending_callbacks(), 1);

        let (log, make) = recorder();
        cache.load(forged, make(1));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn overlay_cycle_on_the_wire_is_not_linked() {
        let mut cache = ClientAppearanceCache::default();
        let first = AppearanceId(1);
        let second = AppearanceId(2);
        cache.insert(
            first,
            AppearanceState {
                overlays: vec![second],
                ..AppearanceState::default()
            },
        );
        cache.insert(
            second,
            AppearanceState {
                overlays: vec![first],
                ..AppearanceState::default()
            },
        );
        assert!(cache.is_empty());
        assert!(cache.get(first).is_none());

        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            first,
            AppearanceState {
                overlays: vec![second],
                ..AppearanceState::default()
            },
        );
        snapshot.insert(
            second,
            AppearanceState {
                underlays: vec![first],
                ..AppearanceState::default()
            },
        );
        cache.apply_snapshot(AppearanceSnapshot {
            appearances: snapshot,
        });
        assert!(cache.is_empty());
        assert!(cache.shared_mutable_snapshot(first).is_none());
    }

    #[test]
    fn animation_waits_for_its_target_appearance() {
        let mut cache = ClientAppearanceCache::default();
        let (id, state) = state_of(&Appearance::with_icon(ResourceId(1), "open"));
        cache.apply_message(AppearanceMessage::Animate(AnimateAppearance {
            target: AnimationTarget::Entity(5),
            target_appearance: id,
            duration: Duration::from_millis(250),
            easing: AnimationEasing::Sine,
            loop_count: 1,
            flags: AnimationFlags::empty(),
            delay_ms: 0,
            chain: false,
        }));
        assert!(cache.drain_icon_updates().is_empty());

        cache.apply_message(AppearanceMessage::Added(AppearanceAdded {
            id,
            appearance: state,
        }));
        let updates = cache.drain_icon_updates();
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            IconUpdate::Animation {
                target,
                appearance,
                params,
            } => {
                assert_eq!(*target, AnimationTarget::Entity(5));
                assert_eq!(appearance.id(), id);
                assert_eq!(params.duration, Duration::from_millis(250));
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn turf_bounds_use_the_configured_tile_size() {
        let mut cache = ClientAppearanceCache::default().with_tile_size(64);
        let (id, state) = state_of(&Appearance::with_icon(ResourceId(4), "floor"));
        cache.insert(id, state);
        let turf_id = turf_id_for(id);
        assert!(cache.turf_icon(turf_id).appearance().is_some());

        let bounds = cache
            .turf_bounds(turf_id, Vec2::new(1.0, 1.0), |_| Some(UVec2::new(32, 32)))
            .expect("bounds");
        assert_eq!(bounds.max, Vec2::new(1.5, 1.5));
        assert!(cache
            .turf_bounds(turf_id + 1, Vec2::ZERO, |_| Some(UVec2::ONE))
            .is_none());
    }

    #[test]
    fn turf_icon_picks_up_late_appearance() {
        let mut cache = ClientAppearanceCache::default();
        let (id, state) = state_of(&Appearance::with_icon(ResourceId(4), "floor"));
        let turf_id = turf_id_for(id);

        assert!(cache.turf_icon(turf_id).appearance().is_none());
        cache.insert(id, state);

        let updates = cache.drain_icon_updates();
        assert!(matches!(
            &updates[..],
            [IconUpdate::Appearance { target: AnimationTarget::Turf(t), .. }] if *t == turf_id
        ));
        assert!(cache.turf_icon(turf_id).appearance().is_none());
        assert!(cache.existing_turf_icon(turf_id + 1).is_none());
    }
}
