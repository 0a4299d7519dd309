use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use appearance_proto::{read_frame, write_frame, AppearanceMessage, ProtoError};
use bevy::prelude::*;
use crossbeam_channel::{unbounded, Receiver};

use crate::broadcast::AppearanceBroadcaster;
use crate::registry::ServerAppearanceRegistry;

/// Listening socket whose accepted connections become broadcaster sessions.
#[derive(Resource)]
pub struct AppearanceServer {
    incoming: Receiver<TcpStream>,
    local_addr: SocketAddr,
}

impl AppearanceServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub fn start_appearance_server(bind_addr: SocketAddr) -> Option<AppearanceServer> {
    let listener = match TcpListener::bind(bind_addr) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::warn!(
                target: "appearance::network",
                %bind_addr,
                error = %err,
                "server.bind_failed=sync_disabled"
            );
            return None;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::warn!(target: "appearance::network", error = %err, "server.local_addr_failed");
            return None;
        }
    };

    let (sender, incoming) = unbounded::<TcpStream>();
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if sender.send(stream).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(target: "appearance::network", error = %err, "server.accept_failed");
                    thread::sleep(std::time::Duration::from_millis(200));
                }
            }
        }
    });

    tracing::info!(target: "appearance::network", %local_addr, "server.listening");
    Some(AppearanceServer {
        incoming,
        local_addr,
    })
}

/// Turn newly accepted connections into sessions, each served by its own
/// writer thread.
pub fn accept_appearance_clients(
    server: Option<Res<AppearanceServer>>,
    registry: Res<ServerAppearanceRegistry>,
    mut broadcaster: ResMut<AppearanceBroadcaster>,
) {
    let Some(server) = server else {
        return;
    };
    for stream in server.incoming.try_iter() {
        let peer = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(target: "appearance::network", error = %err, "client.nodelay_failed");
        }
        let (session, messages) = broadcaster.connect(&registry);
        tracing::info!(target: "appearance::network", %session, ?peer, "client.connected");
        thread::spawn(move || {
            let mut writer = BufWriter::new(stream);
            match serve_session(&mut writer, &messages) {
                Ok(sent) => {
                    tracing::info!(target: "appearance::network", %session, sent, "session.closed");
                }
                Err(err) => {
                    tracing::warn!(
                        target: "appearance::network",
                        %session,
                        error = %err,
                        "session.dropped=write_failed"
                    );
                }
            }
        });
    }
}

/// Write every message of a session as a frame until its channel closes.
/// Returns the number of frames written.
///
/// The writer is flushed whenever the channel runs dry, so batched messages
/// share a flush.
pub fn serve_session<W: Write>(
    writer: &mut W,
    messages: &Receiver<AppearanceMessage>,
) -> Result<usize, ProtoError> {
    let mut sent = 0;
    for message in messages.iter() {
        write_frame(writer, &message)?;
        sent += 1;
        if messages.is_empty() {
            writer.flush()?;
        }
    }
    writer.flush()?;
    Ok(sent)
}

/// Decode frames from `reader` on a background thread.
///
/// The returned channel closes at end of stream or on the first malformed
/// frame.
pub fn spawn_frame_reader<R>(reader: R) -> Receiver<AppearanceMessage>
where
    R: Read + Send + 'static,
{
    let (sender, receiver) = unbounded();
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame(&mut reader) {
                Ok(Some(message)) => {
                    if sender.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(target: "appearance::network", "reader.closed=eof");
                    break;
                }
                Err(err) => {
                    tracing::warn!(target: "appearance::network", error = %err, "reader.closed=bad_frame");
                    break;
                }
            }
        }
    });
    receiver
}

/// Connect to an appearance server and stream its messages.
pub fn connect_appearance_client(addr: SocketAddr) -> io::Result<Receiver<AppearanceMessage>> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(spawn_frame_reader(stream))
}
