use parking_lot::Mutex;
use thiserror::Error;

use conduit_core::message::Tag;

/// Ceiling from the 24-bit tag field in the wire framing.
pub const MAX_TAG: u32 = (1 << 24) - 1;

/// `0` is reserved for one-way calls, `1` for liveness pings; the pool only ever hands out
/// `[2, MAX_TAG]`.
const FIRST_ALLOCATABLE_TAG: u32 = 2;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("tag pool exhausted")]
pub struct PoolExhausted;

struct Inner {
    free: Vec<u32>,
    high_water: u32,
}

/// Allocator for the per-connection tags a multiplexed transport stamps on in-flight calls.
/// Released tags are reused before the high-water mark is advanced, so a long-lived
/// connection settles into a small working set rather than monotonically consuming the
/// 24-bit space.
pub struct TagPool {
    inner: Mutex<Inner>,
}

impl TagPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                high_water: FIRST_ALLOCATABLE_TAG,
            }),
        }
    }

    pub fn acquire(&self) -> Result<Tag, PoolExhausted> {
        let mut inner = self.inner.lock();
        if let Some(tag) = inner.free.pop() {
            return Ok(Tag(tag));
        }
        if inner.high_water > MAX_TAG {
            return Err(PoolExhausted);
        }
        let tag = inner.high_water;
        inner.high_water += 1;
        Ok(Tag(tag))
    }

    /// Returns a tag to the free set. Releasing a tag that was never acquired (or was already
    /// released) corrupts the pool — callers are expected to release each acquired tag exactly
    /// once.
    pub fn release(&self, tag: Tag) {
        self.inner.lock().free.push(tag.0);
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> u32 {
        let inner = self.inner.lock();
        inner.high_water - FIRST_ALLOCATABLE_TAG - inner.free.len() as u32
    }
}

impl Default for TagPool {
    fn default() -> Self {
        Self::new()
    }
}
