//! Authoritative, content-addressed appearance store.
//!
//! The registry keeps only weak back-references: whoever holds an
//! [`AppearanceRef`] keeps the appearance alive, and dropping the last one
//! removes the entry and queues an `AppearanceRemoved` for every client.
//!
//! All map access goes through one mutex. Canonicalization, state conversion
//! and every `Arc` drop happen outside it; the only side effect inside the
//! critical section is pushing onto the unbounded outbound queue, which keeps
//! adds and removes for the same id in lock order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use appearance_proto::{
    AnimateAppearance, AnimationTarget, AppearanceAdded, AppearanceId, AppearanceMessage,
    AppearanceProperties, AppearanceRemoved, AppearanceSnapshot,
};
use bevy::prelude::Resource;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::animation::AnimationParams;
use crate::appearance::{
    Appearance, AppearanceError, AppearanceRef, CanonicalAppearance, DEFAULT_MAX_OVERLAY_DEPTH,
};
use crate::broadcast::SessionId;

/// Item on the registry's ordered outbound queue.
#[derive(Debug)]
pub enum OutboundEvent {
    Message(AppearanceMessage),
    /// A session asked to join. Carries the live set captured under the
    /// registry lock, so the snapshot sits at the right point of the stream.
    Join {
        session: SessionId,
        appearances: Vec<AppearanceRef>,
    },
}

/// Receiving end of the registry's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue(Receiver<OutboundEvent>);

impl OutboundQueue {
    pub fn try_recv(&self) -> Option<OutboundEvent> {
        self.0.try_recv().ok()
    }

    pub fn drain(&self) -> Vec<OutboundEvent> {
        self.0.try_iter().collect()
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live: u64,
    pub interned: u64,
    pub deduplicated: u64,
    pub released: u64,
}

#[derive(Default)]
struct RegistryCounters {
    interned: AtomicU64,
    deduplicated: AtomicU64,
    released: AtomicU64,
}

pub(crate) struct RegistryShared {
    entries: Mutex<HashMap<AppearanceId, Weak<CanonicalAppearance>>>,
    outbound: Sender<OutboundEvent>,
    counters: RegistryCounters,
}

impl RegistryShared {
    fn send(&self, event: OutboundEvent) -> Option<OutboundEvent> {
        self.outbound.send(event).err().map(|err| err.into_inner())
    }

    fn intern_canonical(self: &Arc<Self>, candidate: AppearanceRef) -> AppearanceRef {
        let id = candidate.id();
        let state = candidate.to_state();

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id).and_then(Weak::upgrade) {
            drop(entries);
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            return existing;
        }
        entries.insert(id, Arc::downgrade(&candidate));
        let undelivered = self.send(OutboundEvent::Message(AppearanceMessage::Added(
            AppearanceAdded {
                id,
                appearance: state,
            },
        )));
        drop(entries);

        candidate.bind_registry(Arc::downgrade(self));
        self.counters.interned.fetch_add(1, Ordering::Relaxed);
        if undelivered.is_some() {
            tracing::warn!(
                target: "appearance::registry",
                %id,
                "appearance.added_undelivered=outbound_closed"
            );
        }
        tracing::debug!(target: "appearance::registry", %id, "appearance.created");
        candidate
    }

    /// Drop the entry for `id` if nothing holds it any more.
    ///
    /// Called from [`CanonicalAppearance`]'s `Drop`. A concurrent `intern` may
    /// already have replaced the entry with a fresh instance of the same
    /// content; in that case the entry is live and stays.
    pub(crate) fn release(&self, id: AppearanceId) {
        let mut entries = self.entries.lock();
        let vacant = entries
            .get(&id)
            .map(|weak| weak.strong_count() == 0)
            .unwrap_or(false);
        if !vacant {
            return;
        }
        entries.remove(&id);
        let undelivered = self.send(OutboundEvent::Message(AppearanceMessage::Removed(
            AppearanceRemoved { id },
        )));
        drop(entries);

        self.counters.released.fetch_add(1, Ordering::Relaxed);
        if undelivered.is_some() {
            tracing::debug!(
                target: "appearance::registry",
                %id,
                "appearance.removed_undelivered=outbound_closed"
            );
        }
        tracing::debug!(target: "appearance::registry", %id, "appearance.deleted");
    }

    fn live(&self) -> Vec<AppearanceRef> {
        let entries = self.entries.lock();
        entries.values().filter_map(Weak::upgrade).collect()
    }
}

/// Server-side appearance registry.
///
/// Cloning yields another handle to the same store, which is how the
/// visibility pass reads it from worker threads.
#[derive(Resource, Clone)]
pub struct ServerAppearanceRegistry {
    shared: Arc<RegistryShared>,
    default_appearance: AppearanceRef,
    max_overlay_depth: usize,
}

impl ServerAppearanceRegistry {
    /// Create a registry and the queue its events are published on.
    ///
    /// The default appearance is interned immediately and held for the
    /// registry's whole lifetime.
    pub fn new(max_overlay_depth: usize) -> (Self, OutboundQueue) {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(RegistryShared {
            entries: Mutex::new(HashMap::new()),
            outbound: sender,
            counters: RegistryCounters::default(),
        });
        let default_appearance = shared.intern_canonical(Arc::new(
            CanonicalAppearance::from_resolved(AppearanceProperties::default(), Vec::new(), Vec::new()),
        ));
        let registry = Self {
            shared,
            default_appearance,
            max_overlay_depth,
        };
        (registry, OutboundQueue(receiver))
    }

    pub fn with_default_limits() -> (Self, OutboundQueue) {
        Self::new(DEFAULT_MAX_OVERLAY_DEPTH)
    }

    pub fn default_appearance(&self) -> &AppearanceRef {
        &self.default_appearance
    }

    /// Canonicalize `appearance` and return the shared instance for its
    /// content, creating and announcing it if none is alive.
    pub fn intern(&self, appearance: &Appearance) -> Result<AppearanceRef, AppearanceError> {
        appearance.validate(self.max_overlay_depth)?;
        Ok(self.intern_tree(appearance))
    }

    fn intern_tree(&self, appearance: &Appearance) -> AppearanceRef {
        let overlays = appearance
            .overlays
            .iter()
            .map(|overlay| self.intern_tree(overlay))
            .collect();
        let underlays = appearance
            .underlays
            .iter()
            .map(|underlay| self.intern_tree(underlay))
            .collect();
        let candidate = Arc::new(CanonicalAppearance::from_resolved(
            appearance.properties.clone(),
            overlays,
            underlays,
        ));
        self.shared.intern_canonical(candidate)
    }

    /// Look up an id the caller knows to be live.
    ///
    /// # Panics
    ///
    /// Panics if the id is unknown or already released; ids referenced during
    /// the current tick are always resolvable on the server.
    pub fn must_lookup(&self, id: AppearanceId) -> AppearanceRef {
        match self.try_lookup(id) {
            Some(appearance) => appearance,
            None => panic!("attempted to access deleted appearance {id} in must_lookup"),
        }
    }

    pub fn try_lookup(&self, id: AppearanceId) -> Option<AppearanceRef> {
        let entries = self.shared.entries.lock();
        let found = entries.get(&id).and_then(Weak::upgrade);
        drop(entries);
        found
    }

    pub fn contains(&self, id: AppearanceId) -> bool {
        self.try_lookup(id).is_some()
    }

    pub fn len(&self) -> usize {
        let entries = self.shared.entries.lock();
        entries.values().filter(|weak| weak.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live appearance in wire form.
    pub fn snapshot_all(&self) -> AppearanceSnapshot {
        let live = self.shared.live();
        let appearances: BTreeMap<_, _> = live
            .iter()
            .map(|appearance| (appearance.id(), appearance.to_state()))
            .collect();
        drop(live);
        AppearanceSnapshot { appearances }
    }

    /// Queue a snapshot for `session` behind every event already published.
    pub(crate) fn join_session(&self, session: SessionId) {
        let entries = self.shared.entries.lock();
        let appearances: Vec<AppearanceRef> = entries.values().filter_map(Weak::upgrade).collect();
        let undelivered = self.shared.send(OutboundEvent::Join {
            session,
            appearances,
        });
        drop(entries);
        // Dropping the captured handles may release entries, which takes the
        // lock again.
        drop(undelivered);
    }

    /// Intern the animation's end state and announce the animation.
    ///
    /// The returned handle is the only thing keeping the end state alive on
    /// the server; dropping it is fine because clients resolve the animation
    /// as soon as the preceding `Added` arrives.
    pub fn animate(
        &self,
        target: AnimationTarget,
        appearance: &Appearance,
        params: AnimationParams,
    ) -> Result<AppearanceRef, AppearanceError> {
        let target_appearance = self.intern(appearance)?;
        let message = AppearanceMessage::Animate(AnimateAppearance {
            target,
            target_appearance: target_appearance.id(),
            duration: params.duration,
            easing: params.easing,
            loop_count: params.loop_count,
            flags: params.flags,
            delay_ms: params.delay_ms,
            chain: params.chain,
        });
        if self.shared.send(OutboundEvent::Message(message)).is_some() {
            tracing::warn!(
                target: "appearance::registry",
                id = %target_appearance.id(),
                "animation.undelivered=outbound_closed"
            );
        }
        Ok(target_appearance)
    }

    pub fn stats(&self) -> RegistryStats {
        let counters = &self.shared.counters;
        RegistryStats {
            live: self.len() as u64,
            interned: counters.interned.load(Ordering::Relaxed),
            deduplicated: counters.deduplicated.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appearance_proto::{Real, ResourceId};

    fn crate_box(state: &str) -> Appearance {
        Appearance::with_icon(ResourceId(9), state)
    }

    fn messages(queue: &OutboundQueue) -> Vec<AppearanceMessage> {
        queue
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                OutboundEvent::Message(message) => Some(message),
                OutboundEvent::Join { .. } => None,
            })
            .collect()
    }

    #[test]
    fn default_appearance_is_registered_and_kept() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        let default_id = registry.default_appearance().id();
        assert!(registry.contains(default_id));
        assert_eq!(registry.len(), 1);
        let added = messages(&queue);
        assert!(matches!(&added[..], [AppearanceMessage::Added(a)] if a.id == default_id));

        let again = registry.intern(&Appearance::default()).expect("interned");
        assert!(Arc::ptr_eq(&again, registry.default_appearance()));
        drop(again);
        assert!(registry.contains(default_id));
        assert!(messages(&queue).is_empty());
    }

    #[test]
    fn equal_descriptors_intern_to_one_instance() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        queue.drain();

        let a = registry.intern(&crate_box("closed")).expect("interned");
        let b = registry.intern(&crate_box("closed")).expect("interned");
        assert!(Arc::ptr_eq(&a, &b));

        let added = messages(&queue);
        assert_eq!(added.len(), 1);
        let stats = registry.stats();
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.live, 2);
    }

    #[test]
    fn overlays_are_interned_and_shared() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        queue.drain();

        let lid = crate_box("lid");
        let parent = registry
            .intern(&crate_box("closed").with_overlay(lid.clone()))
            .expect("interned");
        let standalone_lid = registry.intern(&lid).expect("interned");

        let slot = &parent.overlays()[0];
        assert!(Arc::ptr_eq(slot.get().expect("resolved"), &standalone_lid));

        // The overlay is announced before the parent that references it.
        let order: Vec<AppearanceId> = messages(&queue)
            .into_iter()
            .filter_map(|message| match message {
                AppearanceMessage::Added(added) => Some(added.id),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![standalone_lid.id(), parent.id()]);
    }

    #[test]
    fn last_release_removes_and_reinterning_restores() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        queue.drain();

        let first = registry.intern(&crate_box("open")).expect("interned");
        let id = first.id();
        let held = Arc::clone(&first);
        drop(first);
        assert!(registry.contains(id));
        drop(held);
        assert!(!registry.contains(id));

        let second = registry.intern(&crate_box("open")).expect("interned");
        assert_eq!(second.id(), id);

        let wire = messages(&queue);
        let kinds: Vec<&str> = wire.iter().map(AppearanceMessage::kind).collect();
        assert_eq!(kinds, vec!["added", "removed", "added"]);
        assert_eq!(registry.stats().released, 1);
    }

    #[test]
    fn releasing_a_parent_cascades_to_unshared_overlays() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        queue.drain();

        let parent = registry
            .intern(&crate_box("closed").with_overlay(crate_box("padlock")))
            .expect("interned");
        assert_eq!(registry.len(), 3);
        drop(parent);
        assert_eq!(registry.len(), 1);

        let removed = messages(&queue)
            .into_iter()
            .filter(|message| matches!(message, AppearanceMessage::Removed(_)))
            .count();
        assert_eq!(removed, 2);
    }

    #[test]
    fn stale_release_does_not_evict_a_live_entry() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        let live = registry.intern(&crate_box("open")).expect("interned");
        queue.drain();

        registry.shared.release(live.id());
        assert!(registry.contains(live.id()));
        assert!(messages(&queue).is_empty());
    }

    #[test]
    fn snapshot_lists_live_appearances_only() {
        let (registry, _queue) = ServerAppearanceRegistry::with_default_limits();
        let kept = registry.intern(&crate_box("kept")).expect("interned");
        let dropped = registry.intern(&crate_box("dropped")).expect("interned");
        let dropped_id = dropped.id();
        drop(dropped);

        let snapshot = registry.snapshot_all();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.appearances.contains_key(&kept.id()));
        assert!(snapshot
            .appearances
            .contains_key(&registry.default_appearance().id()));
        assert!(!snapshot.appearances.contains_key(&dropped_id));
        assert_eq!(snapshot.appearances[&kept.id()], kept.to_state());
    }

    #[test]
    fn lookups_distinguish_live_and_missing() {
        let (registry, _queue) = ServerAppearanceRegistry::with_default_limits();
        let held = registry.intern(&crate_box("held")).expect("interned");
        assert!(Arc::ptr_eq(&registry.must_lookup(held.id()), &held));
        assert!(registry.try_lookup(AppearanceId(1)).is_none());
    }

    #[test]
    #[should_panic(expected = "deleted appearance")]
    fn must_lookup_panics_on_missing_id() {
        let (registry, _queue) = ServerAppearanceRegistry::with_default_limits();
        registry.must_lookup(AppearanceId(1));
    }

    #[test]
    fn too_deep_descriptors_never_reach_the_store() {
        let (registry, queue) = ServerAppearanceRegistry::new(1);
        queue.drain();
        let deep = crate_box("a").with_overlay(crate_box("b").with_overlay(crate_box("c")));
        let err = registry.intern(&deep).unwrap_err();
        assert_eq!(err, AppearanceError::OverlayDepthExceeded { depth: 2, max: 1 });
        assert!(queue.drain().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn animate_publishes_after_the_target_is_added() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        queue.drain();

        let mut faded = crate_box("open");
        faded.properties.alpha = 0;
        faded.properties.layer = Real(3.0);
        let target = registry
            .animate(
                AnimationTarget::Entity(77),
                &faded,
                AnimationParams::default(),
            )
            .expect("animated");

        let wire = messages(&queue);
        assert_eq!(wire.len(), 2);
        assert!(matches!(&wire[0], AppearanceMessage::Added(a) if a.id == target.id()));
        assert!(matches!(
            &wire[1],
            AppearanceMessage::Animate(anim)
                if anim.target_appearance == target.id()
                    && anim.target == AnimationTarget::Entity(77)
        ));
    }

    #[test]
    fn concurrent_lookups_and_interns_stay_consistent() {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        let reader = registry.clone();
        let pinned = registry.intern(&crate_box("pinned")).expect("interned");
        let pinned_id = pinned.id();

        let handle = std::thread::spawn(move || {
            for _ in 0..500 {
                assert!(reader.try_lookup(pinned_id).is_some());
            }
        });
        for round in 0..500 {
            let transient = registry
                .intern(&crate_box(&format!("transient-{}", round % 7)))
                .expect("interned");
            drop(transient);
        }
        handle.join().expect("reader thread");

        assert_eq!(registry.len(), 2);
        let wire = messages(&queue);
        let added = wire
            .iter()
            .filter(|m| matches!(m, AppearanceMessage::Added(_)))
            .count();
        let removed = wire
            .iter()
            .filter(|m| matches!(m, AppearanceMessage::Removed(_)))
            .count();
        assert_eq!(added - removed, 2);
    }
}
