#![allow(dead_code)]

use std::sync::Once;

use appearance_core::{
    build_client_app, build_server_app, AppearanceBroadcaster, AppearanceConfig,
    ClientAppearanceCache, ServerAppearanceRegistry, SessionId,
};
use appearance_proto::AppearanceMessage;
use bevy::prelude::App;
use crossbeam_channel::Receiver;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Open a raw session on a server app without a client app behind it.
pub fn connect_session(server: &mut App) -> (SessionId, Receiver<AppearanceMessage>) {
    let registry = server.world.resource::<ServerAppearanceRegistry>().clone();
    server
        .world
        .resource_mut::<AppearanceBroadcaster>()
        .connect(&registry)
}

/// A server app and one client app joined over an in-process session.
pub struct ServerClientPair {
    pub server: App,
    pub client: App,
    pub session: SessionId,
}

impl ServerClientPair {
    pub fn new() -> Self {
        init_tracing();
        let config = AppearanceConfig::builtin();
        let mut server = build_server_app(config.clone());
        let (session, inbox) = connect_session(&mut server);
        let client = build_client_app(config, inbox);
        Self {
            server,
            client,
            session,
        }
    }

    pub fn registry(&self) -> ServerAppearanceRegistry {
        self.server.world.resource::<ServerAppearanceRegistry>().clone()
    }

    pub fn cache(&self) -> &ClientAppearanceCache {
        self.client.world.resource::<ClientAppearanceCache>()
    }

    /// One server tick followed by one client tick.
    pub fn tick(&mut self) {
        self.server.update();
        self.client.update();
    }
}
