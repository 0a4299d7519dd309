//! Wire data model shared by the appearance server and its clients.
//!
//! Both sides hash appearances with [`content_hash`], so everything that
//! participates in an [`AppearanceState`] encoding is part of the protocol.

mod filter;
mod hashing;
mod state;

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use filter::FilterState;
pub use hashing::{content_hash, FnvHasher};
pub use state::{
    AppearanceFlags, AppearanceId, AppearanceProperties, AppearanceState, ColorMatrix, Direction,
    PixelOffset, Real, ResourceId, Rgba,
};

/// Upper bound on a single framed message.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("binary codec failed: {0}")]
    Binary(#[from] bincode::Error),
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame io failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Full `id → appearance` table sent once to a joining client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppearanceSnapshot {
    pub appearances: BTreeMap<AppearanceId, AppearanceState>,
}

impl AppearanceSnapshot {
    pub fn len(&self) -> usize {
        self.appearances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appearances.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppearanceAdded {
    pub id: AppearanceId,
    pub appearance: AppearanceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppearanceRemoved {
    pub id: AppearanceId,
}

/// Easing curve of an appearance animation.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AnimationEasing {
    #[default]
    Linear = 0,
    Sine = 1,
    Circular = 2,
    Cubic = 3,
    Bounce = 4,
    Elastic = 5,
    Back = 6,
    Quad = 7,
    Jump = 256,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AnimationFlags: u32 {
        const END_NOW = 1;
        const LINEAR_TRANSFORM = 2;
        const PARALLEL = 4;
        const SLICE = 8;
        const EASE_IN = 64;
        const EASE_OUT = 128;
        const RELATIVE = 256;
        const CONTINUE = 512;
    }
}

/// What an animation applies to: a dynamic entity (by entity bits) or a
/// static turf tile (by turf id, which is its appearance id plus one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnimationTarget {
    Entity(u64),
    Turf(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimateAppearance {
    pub target: AnimationTarget,
    pub target_appearance: AppearanceId,
    pub duration: Duration,
    pub easing: AnimationEasing,
    pub loop_count: i32,
    pub flags: AnimationFlags,
    pub delay_ms: i32,
    pub chain: bool,
}

/// Everything the appearance server sends to a client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppearanceMessage {
    Snapshot(AppearanceSnapshot),
    Added(AppearanceAdded),
    Removed(AppearanceRemoved),
    Animate(AnimateAppearance),
}

impl AppearanceMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AppearanceMessage::Snapshot(_) => "snapshot",
            AppearanceMessage::Added(_) => "added",
            AppearanceMessage::Removed(_) => "removed",
            AppearanceMessage::Animate(_) => "animate",
        }
    }
}

pub fn encode_message(message: &AppearanceMessage) -> Result<Vec<u8>, ProtoError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode_message(bytes: &[u8]) -> Result<AppearanceMessage, ProtoError> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_message_json(message: &AppearanceMessage) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_message_json(data: &str) -> Result<AppearanceMessage, ProtoError> {
    Ok(serde_json::from_str(data)?)
}

/// Write one message as a little-endian `u32` length followed by its bincode
/// payload.
pub fn write_frame<W: Write>(writer: &mut W, message: &AppearanceMessage) -> Result<(), ProtoError> {
    let payload = encode_message(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = payload.len() as u32;
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(&payload);
    writer.write_all(&buffer)?;
    Ok(())
}

/// Read one framed message. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<AppearanceMessage>, ProtoError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_message(&payload).map(Some)
}
