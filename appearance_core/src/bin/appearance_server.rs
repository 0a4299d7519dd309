use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;

use appearance_core::network::start_appearance_server;
use appearance_core::visibility::GridPosition;
use appearance_core::{
    build_server_app, load_appearance_config_from_env, AnimationParams, Appearance,
    AppearanceSprite, ServerAppearanceRegistry,
};
use appearance_proto::{AnimationTarget, ResourceId};
use bevy::math::UVec2;
use bevy::prelude::{App, Entity};
use crossbeam_channel::{unbounded, Receiver};
use tracing::{info, warn};

const TICK: Duration = Duration::from_millis(50);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_appearance_config_from_env();
    let mut app = build_server_app(config.clone());
    match start_appearance_server(config.server_bind) {
        Some(server) => {
            info!(bind = %server.local_addr(), "Appearance server ready");
            app.insert_resource(server);
        }
        None => warn!("Appearance server running without network sync"),
    }

    let commands = spawn_command_reader();
    loop {
        for command in commands.try_iter() {
            apply_command(&mut app, command);
        }
        app.update();
        thread::sleep(TICK);
    }
}

#[derive(Debug)]
enum Command {
    Spawn { icon: u32, state: String, x: u32, y: u32 },
    Despawn { entity: u64 },
    Fade { entity: u64, alpha: u8, millis: u64 },
}

fn spawn_command_reader() -> Receiver<Command> {
    let (sender, receiver) = unbounded::<Command>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("Command read error: {}", err);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_command(trimmed) {
                Some(command) => {
                    if sender.send(command).is_err() {
                        break;
                    }
                }
                None => warn!("Invalid command: {}", trimmed),
            }
        }
    });
    receiver
}

fn parse_command(input: &str) -> Option<Command> {
    let mut parts = input.split_whitespace();
    match parts.next()? {
        "spawn" => Some(Command::Spawn {
            icon: parts.next()?.parse().ok()?,
            state: parts.next()?.to_string(),
            x: parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            y: parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
        }),
        "despawn" => Some(Command::Despawn {
            entity: parts.next()?.parse().ok()?,
        }),
        "fade" => Some(Command::Fade {
            entity: parts.next()?.parse().ok()?,
            alpha: parts.next()?.parse().ok()?,
            millis: parts.next().and_then(|v| v.parse().ok()).unwrap_or(250),
        }),
        _ => None,
    }
}

fn apply_command(app: &mut App, command: Command) {
    let registry = app.world.resource::<ServerAppearanceRegistry>().clone();
    match command {
        Command::Spawn { icon, state, x, y } => {
            let mut sprite = AppearanceSprite::default();
            let appearance = Appearance::with_icon(ResourceId(icon), state);
            if let Err(err) = sprite.set_appearance(&registry, &appearance) {
                warn!("Spawn rejected: {}", err);
                return;
            }
            let entity = app.world.spawn((sprite, GridPosition(UVec2::new(x, y)))).id();
            info!(
                target: "appearance::server",
                entity = entity.to_bits(),
                "command.applied=spawn"
            );
        }
        Command::Despawn { entity } => {
            let despawned = Entity::try_from_bits(entity)
                .ok()
                .map(|entity| app.world.despawn(entity))
                .unwrap_or(false);
            info!(target: "appearance::server", entity, despawned, "command.applied=despawn");
        }
        Command::Fade {
            entity,
            alpha,
            millis,
        } => {
            let Some(target) = Entity::try_from_bits(entity).ok() else {
                warn!("Invalid entity: {}", entity);
                return;
            };
            let Some(mut sprite) = app.world.get_mut::<AppearanceSprite>(target) else {
                warn!("Entity {} has no sprite", entity);
                return;
            };
            let Some(mut faded) = sprite.appearance().and_then(|a| a.to_mutable().ok()) else {
                return;
            };
            faded.properties.alpha = alpha;
            let params = AnimationParams {
                duration: Duration::from_millis(millis),
                ..AnimationParams::default()
            };
            if let Err(err) = sprite.set_appearance(&registry, &faded) {
                warn!("Fade rejected: {}", err);
                return;
            }
            match registry.animate(AnimationTarget::Entity(entity), &faded, params) {
                Ok(_) => info!(target: "appearance::server", entity, alpha, "command.applied=fade"),
                Err(err) => warn!("Fade rejected: {}", err),
            }
        }
    }
}
