//! Sliding-cursor packet buffers and the pool that backs them
//!
//! A [`Buffer`] is a view into a heap arena with two movable cursors. Framing
//! code prepends headers and appends MACs, nonces and obfuscation tails by
//! sliding the cursors into pre-reserved capacity instead of copying, and the
//! AEAD layer seals and opens payloads in place inside the same arena.
//!
//! Ownership replaces the reference counting of a shared-slab design: exactly
//! one task holds a buffer at any time, and handing a packet to another task
//! moves the buffer through a channel. Returning a buffer to the pool moves it
//! too, so a double `put` cannot be expressed.

use chacha20poly1305::aead;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("insufficient capacity: requested {requested} bytes, {available} available")]
    InsufficientCapacity { requested: usize, available: usize },

    #[error("slice does not alias the buffer arena")]
    NotAliased,

    #[error("requested length {0} exceeds pool payload size {1}")]
    OversizedRequest(usize, usize),
}

/// A view `[start, end)` into an owned byte arena `[0, cap)`.
///
/// Invariant: `start <= end <= cap`. `length = end - start`; the space below
/// `start` is backward capacity, the space above `end` forward capacity.
pub struct Buffer {
    arena: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Buffer {
    /// Wrap an owned arena with the view covering all of it.
    pub fn from_arena(arena: Box<[u8]>) -> Self {
        let end = arena.len();
        Self { arena, start: 0, end }
    }

    /// Copy `data` into a fresh arena with no spare capacity.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_arena(data.to_vec().into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Backward capacity: bytes available below `start`.
    pub fn back_cap(&self) -> usize {
        self.start
    }

    /// Forward capacity: bytes available above `end`.
    pub fn fwd_cap(&self) -> usize {
        self.arena.len() - self.end
    }

    pub fn slice(&self) -> &[u8] {
        &self.arena[self.start..self.end]
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        &mut self.arena[self.start..self.end]
    }

    /// Borrow the sub-range `[lo, hi)` of the current view.
    ///
    /// Panics when the range leaves `[0, length]`; like out-of-bounds
    /// indexing, that is a programmer error, not a runtime condition.
    pub fn reslice(&self, lo: usize, hi: usize) -> &[u8] {
        assert!(lo <= hi && hi <= self.len(), "reslice [{lo}, {hi}) out of [0, {}]", self.len());
        &self.arena[self.start + lo..self.start + hi]
    }

    /// Narrow the view to the sub-range `[lo, hi)`, consuming self.
    ///
    /// The excluded bytes become backward/forward capacity. Panics when the
    /// range leaves `[0, length]`.
    pub fn rebuffer(mut self, lo: usize, hi: usize) -> Buffer {
        assert!(lo <= hi && hi <= self.len(), "rebuffer [{lo}, {hi}) out of [0, {}]", self.len());
        self.end = self.start + hi;
        self.start += lo;
        self
    }

    /// Widen the view by `before` bytes backward and `after` bytes forward.
    ///
    /// The uncovered bytes keep whatever contents the arena holds; callers
    /// overwrite them. Fails when either side exceeds the arena.
    pub fn expand(mut self, before: usize, after: usize) -> Result<Buffer, BufferError> {
        if before > self.back_cap() {
            return Err(BufferError::InsufficientCapacity { requested: before, available: self.back_cap() });
        }
        if after > self.fwd_cap() {
            return Err(BufferError::InsufficientCapacity { requested: after, available: self.fwd_cap() });
        }
        self.start -= before;
        self.end += after;
        Ok(self)
    }

    /// Copy `data` into forward capacity, growing the view over it.
    pub fn append(mut self, data: &[u8]) -> Result<Buffer, BufferError> {
        if data.len() > self.fwd_cap() {
            return Err(BufferError::InsufficientCapacity { requested: data.len(), available: self.fwd_cap() });
        }
        self.arena[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
        Ok(self)
    }

    /// Copy `data` into backward capacity, growing the view under it.
    pub fn prepend(mut self, data: &[u8]) -> Result<Buffer, BufferError> {
        if data.len() > self.back_cap() {
            return Err(BufferError::InsufficientCapacity { requested: data.len(), available: self.back_cap() });
        }
        self.arena[self.start - data.len()..self.start].copy_from_slice(data);
        self.start -= data.len();
        Ok(self)
    }

    pub fn append_buffer(self, other: &Buffer) -> Result<Buffer, BufferError> {
        self.append(other.slice())
    }

    pub fn prepend_buffer(self, other: &Buffer) -> Result<Buffer, BufferError> {
        self.prepend(other.slice())
    }

    /// Assert that `raw` aliases this buffer's arena at `start` and narrow the
    /// view to its length.
    ///
    /// Guards in-place transformations: a callee that was handed
    /// `slice_mut()` and claims to have worked in place must hand back a
    /// slice living at the same address.
    pub fn ensure_same_slice(mut self, raw: &[u8]) -> Result<Buffer, BufferError> {
        let base = self.arena[self.start..].as_ptr();
        if raw.as_ptr() != base || raw.len() > self.arena.len() - self.start {
            return Err(BufferError::NotAliased);
        }
        self.end = self.start + raw.len();
        Ok(self)
    }

    fn into_arena(self) -> Box<[u8]> {
        self.arena
    }
}

/// In-place AEAD support: sealing extends into forward capacity (the MAC
/// lands where callers pre-reserved room), opening truncates the tag off.
/// Neither path can reallocate, so a sealed packet is guaranteed to still
/// occupy the pooled arena.
impl aead::Buffer for Buffer {
    fn extend_from_slice(&mut self, other: &[u8]) -> aead::Result<()> {
        if other.len() > self.fwd_cap() {
            return Err(aead::Error);
        }
        self.arena[self.end..self.end + other.len()].copy_from_slice(other);
        self.end += other.len();
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.end = self.start + len;
        }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.slice()
    }
}

impl AsMut<[u8]> for Buffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.slice_mut()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("cap", &self.arena.len())
            .finish()
    }
}

/// Arena allocator for maximum-size packets with fixed headroom and tailroom.
///
/// Every arena is `headroom + max_payload + tailroom` bytes; `get` positions
/// the view at the headroom mark so protocol layers can prepend headers and
/// append AEAD overhead without copying. The free list sits behind a
/// non-suspending mutex: `get` and `put` are safe to call anywhere inside
/// async tasks.
pub struct PacketPool {
    headroom: usize,
    tailroom: usize,
    max_payload: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl PacketPool {
    pub fn new(headroom: usize, max_payload: usize, tailroom: usize) -> Self {
        Self { headroom, tailroom, max_payload, free: Mutex::new(Vec::new()) }
    }

    fn arena_size(&self) -> usize {
        self.headroom + self.max_payload + self.tailroom
    }

    fn take_arena(&self) -> Box<[u8]> {
        let cached = self.free.lock().ok().and_then(|mut free| free.pop());
        cached.unwrap_or_else(|| vec![0u8; self.arena_size()].into_boxed_slice())
    }

    /// A buffer of `length = len` positioned at the headroom mark.
    pub fn get(&self, len: usize) -> Result<Buffer, BufferError> {
        if len > self.max_payload {
            return Err(BufferError::OversizedRequest(len, self.max_payload));
        }
        let arena = self.take_arena();
        Ok(Buffer { arena, start: self.headroom, end: self.headroom + len })
    }

    /// A buffer covering the whole payload area.
    pub fn get_full(&self) -> Buffer {
        let arena = self.take_arena();
        Buffer { arena, start: self.headroom, end: self.headroom + self.max_payload }
    }

    /// Return a buffer's arena to the free list.
    pub fn put(&self, buffer: Buffer) {
        let arena = buffer.into_arena();
        if arena.len() == self.arena_size() {
            if let Ok(mut free) = self.free.lock() {
                free.push(arena);
            }
        }
    }
}
