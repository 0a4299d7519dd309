use std::hash::Hasher;
use std::io;

use crate::state::{AppearanceId, AppearanceState};

/// A deterministic FNV-1a 64-bit hasher.
///
/// Appearance ids are derived from this hasher on both the server and every
/// client, so it must never be swapped for `DefaultHasher` (randomized per
/// process) or any hasher whose output depends on CPU features.
#[derive(Debug, Clone)]
pub struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self {
            state: Self::OFFSET_BASIS,
        }
    }
}

impl Default for FnvHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }
}

/// Sink that feeds serialized bytes straight into the hasher.
struct HashWriter<'a>(&'a mut FnvHasher);

impl io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Content hash of an appearance in its wire form.
///
/// The bincode encoding is fixed-width little endian with 64-bit lengths, so
/// the same field values produce the same id on every platform. Overlays
/// participate only through their own ids.
pub fn content_hash(state: &AppearanceState) -> AppearanceId {
    let mut hasher = FnvHasher::new();
    bincode::serialize_into(HashWriter(&mut hasher), state)
        .expect("appearance state serialization for hashing");
    AppearanceId(hasher.finish())
}
