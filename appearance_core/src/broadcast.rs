//! Fan-out of registry events to connected client sessions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use appearance_proto::{AppearanceMessage, AppearanceSnapshot};
use bevy::prelude::*;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::registry::{OutboundEvent, OutboundQueue, ServerAppearanceRegistry};

/// Identifier of one client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivers the registry's outbound stream to every joined session, in order.
///
/// A session becomes active when its join marker comes off the queue: it is
/// sent the snapshot captured at join time, then every later event.
#[derive(Resource)]
pub struct AppearanceBroadcaster {
    outbound: OutboundQueue,
    sessions: BTreeMap<SessionId, Sender<AppearanceMessage>>,
    joining: HashMap<SessionId, Sender<AppearanceMessage>>,
    next_session: u64,
}

impl AppearanceBroadcaster {
    pub fn new(outbound: OutboundQueue) -> Self {
        Self {
            outbound,
            sessions: BTreeMap::new(),
            joining: HashMap::new(),
            next_session: 1,
        }
    }

    /// Open a session. Its receiver yields the join snapshot on the next
    /// [`flush`](Self::flush), followed by incremental messages.
    pub fn connect(
        &mut self,
        registry: &ServerAppearanceRegistry,
    ) -> (SessionId, Receiver<AppearanceMessage>) {
        let session = SessionId(self.next_session);
        self.next_session += 1;
        let (sender, receiver) = unbounded();
        self.joining.insert(session, sender);
        registry.join_session(session);
        (session, receiver)
    }

    pub fn disconnect(&mut self, session: SessionId) {
        let was_known =
            self.sessions.remove(&session).is_some() | self.joining.remove(&session).is_some();
        if was_known {
            tracing::info!(target: "appearance::broadcast", %session, "session.disconnected");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    /// Drain the outbound queue. Returns the number of events processed.
    pub fn flush(&mut self) -> usize {
        let mut processed = 0;
        while let Some(event) = self.outbound.try_recv() {
            processed += 1;
            match event {
                OutboundEvent::Message(message) => self.fan_out(message),
                OutboundEvent::Join {
                    session,
                    appearances,
                } => {
                    let snapshot = AppearanceSnapshot {
                        appearances: appearances
                            .iter()
                            .map(|appearance| (appearance.id(), appearance.to_state()))
                            .collect(),
                    };
                    drop(appearances);
                    self.activate(session, snapshot);
                }
            }
        }
        processed
    }

    fn activate(&mut self, session: SessionId, snapshot: AppearanceSnapshot) {
        let Some(sender) = self.joining.remove(&session) else {
            return;
        };
        let count = snapshot.len();
        if sender.send(AppearanceMessage::Snapshot(snapshot)).is_err() {
            tracing::warn!(
                target: "appearance::broadcast",
                %session,
                "session.dropped=closed_before_snapshot"
            );
            return;
        }
        tracing::debug!(
            target: "appearance::broadcast",
            %session,
            appearances = count,
            "session.snapshot_sent"
        );
        self.sessions.insert(session, sender);
    }

    fn fan_out(&mut self, message: AppearanceMessage) {
        self.sessions.retain(|session, sender| {
            match sender.send(message.clone()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::warn!(
                        target: "appearance::broadcast",
                        %session,
                        "session.dropped=receiver_closed"
                    );
                    false
                }
            }
        });
    }
}

/// Deliver everything the registry published this tick.
pub fn flush_appearance_broadcasts(mut broadcaster: ResMut<AppearanceBroadcaster>) {
    broadcaster.flush();
}
