//! Appearance interning and synchronization engine.
//!
//! The server interns every appearance game logic produces into a
//! content-addressed registry and streams additions and removals to connected
//! clients, which mirror the registry and resolve ids that arrive out of
//! order through load callbacks.

pub mod animation;
pub mod appearance;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod filters;
pub mod metrics;
pub mod network;
pub mod registry;
pub mod sprite;
pub mod visibility;

use std::sync::Arc;

use appearance_proto::AppearanceMessage;
use bevy::prelude::*;
use crossbeam_channel::Receiver;

pub use animation::AnimationParams;
pub use appearance::{
    canonicalize, Appearance, AppearanceError, AppearanceRef, CanonicalAppearance, OverlaySlot,
};
pub use broadcast::{AppearanceBroadcaster, SessionId};
pub use client::{AppearanceInbox, ClientAppearanceCache, IconUpdate, LoadCallback};
pub use config::{load_appearance_config_from_env, AppearanceConfig, AppearanceConfigHandle};
pub use filters::{FilterShaderCache, IconTextureLoader, RenderSources, SharedShader, TextureHandle};
pub use metrics::AppearanceMetrics;
pub use registry::{RegistryStats, ServerAppearanceRegistry};
pub use sprite::{AppearanceSprite, ClientSprite, ScreenLocation, SpriteIcon, SpriteState};
pub use visibility::{AppearanceViewer, AppearanceVisibility, GridPosition};

/// Construct a Bevy [`App`] hosting the authoritative registry.
///
/// Network accept is wired in but idle until an
/// [`AppearanceServer`](network::AppearanceServer) resource is inserted.
pub fn build_server_app(config: Arc<AppearanceConfig>) -> App {
    let mut app = App::new();

    let (registry, outbound) = ServerAppearanceRegistry::new(config.max_overlay_depth);

    app.insert_resource(AppearanceConfigHandle::new(config))
        .insert_resource(registry)
        .insert_resource(AppearanceBroadcaster::new(outbound))
        .insert_resource(AppearanceVisibility::default())
        .insert_resource(AppearanceMetrics::default())
        .add_plugins(MinimalPlugins)
        .add_systems(PreUpdate, network::accept_appearance_clients)
        .add_systems(Update, visibility::update_appearance_visibility)
        .add_systems(
            Last,
            (
                broadcast::flush_appearance_broadcasts,
                metrics::collect_appearance_metrics,
            )
                .chain(),
        );

    app
}

/// Construct a Bevy [`App`] mirroring a server through `inbox`.
pub fn build_client_app(config: Arc<AppearanceConfig>, inbox: Receiver<AppearanceMessage>) -> App {
    let mut app = App::new();

    let cache = ClientAppearanceCache::new(config.pending_callback_warn_threshold)
        .with_tile_size(config.tile_size);

    app.insert_resource(AppearanceConfigHandle::new(config))
        .insert_resource(cache)
        .insert_resource(AppearanceInbox(inbox))
        .insert_resource(FilterShaderCache::default())
        .insert_resource(AppearanceMetrics::default())
        .add_plugins(MinimalPlugins)
        .add_systems(PreUpdate, client::receive_appearance_messages)
        .add_systems(Update, client::apply_icon_updates)
        .add_systems(
            Last,
            (
                filters::sweep_filter_shaders,
                metrics::collect_appearance_metrics,
            )
                .chain(),
        );

    app
}
