mod common;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use appearance_core::network::{connect_appearance_client, start_appearance_server};
use appearance_core::{
    build_client_app, build_server_app, Appearance, AppearanceConfig, ClientAppearanceCache,
    ServerAppearanceRegistry,
};
use appearance_proto::ResourceId;
use bevy::prelude::App;

fn pump_until<F>(server: &mut App, client: &mut App, mut done: F) -> Result<()>
where
    F: FnMut(&ClientAppearanceCache) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        server.update();
        client.update();
        if done(client.world.resource::<ClientAppearanceCache>()) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
    bail!("client did not reach the expected state in time")
}

#[test]
fn appearances_sync_over_loopback_tcp() -> Result<()> {
    common::init_tracing();
    let config = AppearanceConfig::builtin();
    let mut server = build_server_app(config.clone());
    let Some(listener) = start_appearance_server("127.0.0.1:0".parse()?) else {
        bail!("loopback bind failed");
    };
    let addr = listener.local_addr();
    server.insert_resource(listener);

    let registry = server.world.resource::<ServerAppearanceRegistry>().clone();
    let banner = registry.intern(
        &Appearance::with_icon(ResourceId(30), "banner")
            .with_overlay(Appearance::with_icon(ResourceId(31), "emblem")),
    )?;

    let inbox = connect_appearance_client(addr)?;
    let mut client = build_client_app(config, inbox);

    let banner_id = banner.id();
    pump_until(&mut server, &mut client, |cache| {
        cache
            .get(banner_id)
            .map(|appearance| appearance.is_fully_resolved())
            .unwrap_or(false)
    })?;

    drop(banner);
    pump_until(&mut server, &mut client, |cache| cache.get(banner_id).is_none())?;
    Ok(())
}
