//! Mutable appearance descriptors and their canonical, content-addressed form.
//!
//! An [`Appearance`] is what game logic edits. A [`CanonicalAppearance`] is the
//! frozen value shared by every entity that looks the same; its id is the
//! FNV-1a hash of its wire state, so equal descriptors always produce equal
//! ids on the server and on every client.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use appearance_proto::{AppearanceId, AppearanceProperties, AppearanceState, ResourceId};
use thiserror::Error;

use crate::registry::RegistryShared;

/// Overlay nesting accepted by [`canonicalize`].
pub const DEFAULT_MAX_OVERLAY_DEPTH: usize = 16;

/// Strong, owning handle to a canonical appearance.
pub type AppearanceRef = Arc<CanonicalAppearance>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppearanceError {
    #[error("overlay nesting depth {depth} exceeds the limit of {max}")]
    OverlayDepthExceeded { depth: usize, max: usize },
    #[error("overlay {0} has not been resolved yet")]
    UnresolvedOverlay(AppearanceId),
    #[error("appearance sent as {id} hashes to {actual}")]
    ContentHashMismatch {
        id: AppearanceId,
        actual: AppearanceId,
    },
}

/// Editable appearance descriptor.
///
/// Overlays are drawn above the parent and underlays below it, each list in
/// order. Nested descriptors are owned values, so a descriptor tree can never
/// contain itself; canonicalization still bounds its depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Appearance {
    pub properties: AppearanceProperties,
    pub overlays: Vec<Appearance>,
    pub underlays: Vec<Appearance>,
}

impl Appearance {
    pub fn new(properties: AppearanceProperties) -> Self {
        Self {
            properties,
            overlays: Vec::new(),
            underlays: Vec::new(),
        }
    }

    pub fn with_icon(icon: ResourceId, icon_state: impl Into<String>) -> Self {
        Self::new(AppearanceProperties {
            icon: Some(icon),
            icon_state: Some(icon_state.into()),
            ..AppearanceProperties::default()
        })
    }

    pub fn with_overlay(mut self, overlay: Appearance) -> Self {
        self.overlays.push(overlay);
        self
    }

    pub fn with_underlay(mut self, underlay: Appearance) -> Self {
        self.underlays.push(underlay);
        self
    }

    /// Deepest overlay/underlay nesting below this descriptor; a descriptor
    /// without overlays has depth 0.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            for child in node.overlays.iter().chain(node.underlays.iter()) {
                stack.push((child, depth + 1));
            }
        }
        deepest
    }

    /// Reject descriptor trees nested deeper than `max_depth`.
    pub fn validate(&self, max_depth: usize) -> Result<(), AppearanceError> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(AppearanceError::OverlayDepthExceeded {
                depth,
                max: max_depth,
            });
        }
        Ok(())
    }
}

/// One entry of a canonical overlay or underlay list.
///
/// The id is always known. The resolved value is filled exactly once: at
/// construction on the server, or when the referenced appearance arrives on a
/// client.
pub struct OverlaySlot {
    id: AppearanceId,
    resolved: OnceLock<AppearanceRef>,
}

impl OverlaySlot {
    fn resolved(appearance: AppearanceRef) -> Self {
        let slot = Self::pending(appearance.id());
        let _ = slot.resolved.set(appearance);
        slot
    }

    fn pending(id: AppearanceId) -> Self {
        Self {
            id,
            resolved: OnceLock::new(),
        }
    }

    pub fn id(&self) -> AppearanceId {
        self.id
    }

    pub fn get(&self) -> Option<&AppearanceRef> {
        self.resolved.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Fill the slot. Returns `false` if it was already resolved.
    pub(crate) fn resolve(&self, appearance: AppearanceRef) -> bool {
        debug_assert_eq!(appearance.id(), self.id);
        self.resolved.set(appearance).is_ok()
    }
}

impl fmt::Debug for OverlaySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlaySlot")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Immutable, content-addressed appearance.
///
/// Equality and hashing use the content id only. Instances interned by the
/// server registry notify it when their last strong handle is dropped.
pub struct CanonicalAppearance {
    id: AppearanceId,
    properties: AppearanceProperties,
    overlays: Vec<OverlaySlot>,
    underlays: Vec<OverlaySlot>,
    registry: OnceLock<Weak<RegistryShared>>,
}

impl CanonicalAppearance {
    /// Build from already-canonical overlays; every slot starts resolved.
    pub(crate) fn from_resolved(
        properties: AppearanceProperties,
        overlays: Vec<AppearanceRef>,
        underlays: Vec<AppearanceRef>,
    ) -> Self {
        let state = AppearanceState {
            properties,
            overlays: overlays.iter().map(|overlay| overlay.id()).collect(),
            underlays: underlays.iter().map(|underlay| underlay.id()).collect(),
        };
        let id = state.content_hash();
        Self {
            id,
            properties: state.properties,
            overlays: overlays.into_iter().map(OverlaySlot::resolved).collect(),
            underlays: underlays.into_iter().map(OverlaySlot::resolved).collect(),
            registry: OnceLock::new(),
        }
    }

    /// Build from a wire state; overlay slots stay pending until resolved by
    /// the owning store.
    pub(crate) fn from_state(state: AppearanceState) -> Self {
        let id = state.content_hash();
        Self {
            id,
            properties: state.properties,
            overlays: state.overlays.into_iter().map(OverlaySlot::pending).collect(),
            underlays: state.underlays.into_iter().map(OverlaySlot::pending).collect(),
            registry: OnceLock::new(),
        }
    }

    pub fn id(&self) -> AppearanceId {
        self.id
    }

    pub fn properties(&self) -> &AppearanceProperties {
        &self.properties
    }

    pub fn overlays(&self) -> &[OverlaySlot] {
        &self.overlays
    }

    pub fn underlays(&self) -> &[OverlaySlot] {
        &self.underlays
    }

    /// Overlay slots followed by underlay slots.
    pub fn slots(&self) -> impl Iterator<Item = &OverlaySlot> {
        self.overlays.iter().chain(self.underlays.iter())
    }

    pub(crate) fn slot_at(&self, index: usize) -> Option<&OverlaySlot> {
        self.slots().nth(index)
    }

    /// True when every overlay and underlay, recursively, is resolved.
    pub fn is_fully_resolved(&self) -> bool {
        self.slots().all(|slot| {
            slot.get()
                .map(|overlay| overlay.is_fully_resolved())
                .unwrap_or(false)
        })
    }

    pub fn to_state(&self) -> AppearanceState {
        AppearanceState {
            properties: self.properties.clone(),
            overlays: self.overlays.iter().map(OverlaySlot::id).collect(),
            underlays: self.underlays.iter().map(OverlaySlot::id).collect(),
        }
    }

    /// Fresh, independently editable copy of this appearance.
    pub fn to_mutable(&self) -> Result<Appearance, AppearanceError> {
        Ok(Appearance {
            properties: self.properties.clone(),
            overlays: Self::slots_to_mutable(&self.overlays)?,
            underlays: Self::slots_to_mutable(&self.underlays)?,
        })
    }

    fn slots_to_mutable(slots: &[OverlaySlot]) -> Result<Vec<Appearance>, AppearanceError> {
        slots
            .iter()
            .map(|slot| {
                slot.get()
                    .ok_or(AppearanceError::UnresolvedOverlay(slot.id))
                    .and_then(|overlay| overlay.to_mutable())
            })
            .collect()
    }

    pub(crate) fn bind_registry(&self, registry: Weak<RegistryShared>) {
        let _ = self.registry.set(registry);
    }
}

impl Drop for CanonicalAppearance {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.release(self.id);
        }
    }
}

impl PartialEq for CanonicalAppearance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CanonicalAppearance {}

impl Hash for CanonicalAppearance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for CanonicalAppearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalAppearance")
            .field("id", &self.id)
            .field("properties", &self.properties)
            .field("overlays", &self.overlays)
            .field("underlays", &self.underlays)
            .finish()
    }
}

/// Canonicalize a descriptor without registering it anywhere.
pub fn canonicalize(appearance: &Appearance) -> Result<AppearanceRef, AppearanceError> {
    canonicalize_with_limit(appearance, DEFAULT_MAX_OVERLAY_DEPTH)
}

pub fn canonicalize_with_limit(
    appearance: &Appearance,
    max_depth: usize,
) -> Result<AppearanceRef, AppearanceError> {
    appearance.validate(max_depth)?;
    Ok(canonicalize_tree(appearance))
}

fn canonicalize_tree(appearance: &Appearance) -> AppearanceRef {
    let overlays = appearance.overlays.iter().map(canonicalize_tree).collect();
    let underlays = appearance.underlays.iter().map(canonicalize_tree).collect();
    Arc::new(CanonicalAppearance::from_resolved(
        appearance.properties.clone(),
        overlays,
        underlays,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use appearance_proto::{Direction, FilterState, PixelOffset, Real, Rgba};

    fn knight() -> Appearance {
        let mut body = Appearance::with_icon(ResourceId(3), "knight");
        body.properties.direction = Direction::East;
        body.properties.layer = Real(4.0);
        body.properties.pixel_offset = PixelOffset::new(2, -3);
        body.properties.color = Rgba::new(200, 180, 160, 255);
        body.properties.filters.push(FilterState::outline(1.0, Rgba::BLACK));
        body.with_overlay(Appearance::with_icon(ResourceId(4), "helmet"))
            .with_overlay(Appearance::with_icon(ResourceId(4), "plume"))
            .with_underlay(Appearance::with_icon(ResourceId(5), "shadow"))
    }

    #[test]
    fn equal_descriptors_share_an_id() {
        let a = canonicalize(&knight()).expect("canonical");
        let b = canonicalize(&knight()).expect("canonical");
        assert_eq!(a.id(), b.id());
        assert_eq!(a, b);
    }

    #[test]
    fn overlay_order_is_significant() {
        let mut swapped = knight();
        swapped.overlays.reverse();
        let a = canonicalize(&knight()).expect("canonical");
        let b = canonicalize(&swapped).expect("canonical");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn mutable_copy_round_trips() {
        let descriptor = knight();
        let canonical = canonicalize(&descriptor).expect("canonical");
        assert_eq!(canonical.to_mutable().expect("resolved"), descriptor);
    }

    #[test]
    fn mutable_copy_is_independent() {
        let canonical = canonicalize(&knight()).expect("canonical");
        let mut copy = canonical.to_mutable().expect("resolved");
        copy.properties.alpha = 10;
        copy.overlays.clear();
        assert_eq!(canonical.properties().alpha, 255);
        assert_eq!(canonical.overlays().len(), 2);
    }

    #[test]
    fn wire_state_hash_matches_canonical_id() {
        let canonical = canonicalize(&knight()).expect("canonical");
        let state = canonical.to_state();
        assert_eq!(state.content_hash(), canonical.id());

        let rebuilt = CanonicalAppearance::from_state(state);
        assert_eq!(rebuilt.id(), canonical.id());
        assert!(!rebuilt.is_fully_resolved());
        assert_eq!(
            rebuilt.to_mutable(),
            Err(AppearanceError::UnresolvedOverlay(
                canonical.overlays()[0].id()
            ))
        );
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut nested = Appearance::with_icon(ResourceId(1), "leaf");
        for _ in 0..4 {
            nested = Appearance::default().with_overlay(nested);
        }
        assert_eq!(nested.depth(), 4);
        assert!(canonicalize_with_limit(&nested, 4).is_ok());
        assert_eq!(
            canonicalize_with_limit(&nested, 3).unwrap_err(),
            AppearanceError::OverlayDepthExceeded { depth: 4, max: 3 }
        );
    }

    #[test]
    fn standalone_canonicals_never_touch_a_registry() {
        let canonical = canonicalize(&knight()).expect("canonical");
        assert!(canonical.registry.get().is_none());
        drop(canonical);
    }
}
