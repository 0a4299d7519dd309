use bevy::prelude::*;

use crate::{
    broadcast::AppearanceBroadcaster, client::ClientAppearanceCache, filters::FilterShaderCache,
    registry::ServerAppearanceRegistry,
};

#[derive(Resource, Default, Debug, Clone)]
pub struct AppearanceMetrics {
    pub tick: u64,
    pub live_appearances: u64,
    pub interned_total: u64,
    pub deduplicated_total: u64,
    pub released_total: u64,
    pub sessions: usize,
    pub mirrored_appearances: usize,
    pub pending_callbacks: usize,
    pub cached_filter_shaders: usize,
}

/// Refresh [`AppearanceMetrics`] from whichever side of the engine is present.
pub fn collect_appearance_metrics(
    mut metrics: ResMut<AppearanceMetrics>,
    registry: Option<Res<ServerAppearanceRegistry>>,
    broadcaster: Option<Res<AppearanceBroadcaster>>,
    client: Option<Res<ClientAppearanceCache>>,
    filters: Option<Res<FilterShaderCache>>,
) {
    metrics.tick += 1;

    if let Some(registry) = registry {
        let stats = registry.stats();
        metrics.live_appearances = stats.live;
        metrics.interned_total = stats.interned;
        metrics.deduplicated_total = stats.deduplicated;
        metrics.released_total = stats.released;
    }
    metrics.sessions = broadcaster.map(|b| b.session_count()).unwrap_or(0);

    if let Some(client) = client {
        metrics.mirrored_appearances = client.len();
        metrics.pending_callbacks = client.pending_callbacks();
    } else {
        metrics.mirrored_appearances = 0;
        metrics.pending_callbacks = 0;
    }
    metrics.cached_filter_shaders = filters.map(|f| f.len()).unwrap_or(0);
}
