// Pooled byte buffers
//
// A `PooledByteBuf` is a reference-counted handle onto a slice of a chunk's
// memory. The reference count and the memory placement live in a shared
// record; derived views (slices, duplicates) clone the record and keep
// their own reader/writer indices, so releasing any view decrements the one
// shared count and the memory returns to its arena exactly once, on the
// transition to zero.
//
// Buffers are not released on drop. The caller owns the release call; a
// buffer dropped while its count is positive is exactly what the leak
// detector exists to report.

pub mod composite;
pub(crate) mod recycler;

pub use composite::CompositeByteBuf;

use crate::error::{PoolError, Result};
use crate::leak::LeakTracker;
use crate::pool::arena::{AllocatedRegion, PoolArena};
use crate::pool::backing::MemoryKind;
use crate::pool::cache::PoolThreadCache;
use crate::pool::chunk::PoolChunk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Default hard capacity cap.
pub const DEFAULT_MAX_CAPACITY: usize = i32::MAX as usize;

/// Memory placement of a live allocation.
#[derive(Debug)]
pub(crate) struct BufState {
    pub(crate) chunk: Arc<PoolChunk>,
    pub(crate) handle: u64,
    pub(crate) offset: usize,
    /// Current capacity.
    pub(crate) length: usize,
    /// Capacity ceiling of the underlying run; growth beyond it
    /// reallocates.
    pub(crate) max_length: usize,
    pub(crate) cache: Option<Arc<PoolThreadCache>>,
}

/// State shared between a buffer and every view derived from it.
#[derive(Debug)]
pub(crate) struct BufShared {
    ref_cnt: AtomicI32,
    arena: Arc<PoolArena>,
    /// `None` once the allocation has been returned to the arena.
    state: Mutex<Option<BufState>>,
    leak: Mutex<Option<LeakTracker>>,
}

impl BufShared {
    pub(crate) fn new(arena: Arc<PoolArena>, state: BufState, leak: Option<LeakTracker>) -> Self {
        Self {
            ref_cnt: AtomicI32::new(1),
            arena,
            state: Mutex::new(Some(state)),
            leak: Mutex::new(leak),
        }
    }

    /// Reinitializes a recycled shell. Caller must hold the only reference.
    pub(crate) fn reinit(
        &mut self,
        arena: Arc<PoolArena>,
        state: BufState,
        leak: Option<LeakTracker>,
    ) {
        self.ref_cnt.store(1, Ordering::Release);
        self.arena = arena;
        *self.state.get_mut() = Some(state);
        *self.leak.get_mut() = leak;
    }

    fn retain(&self, n: i32) -> Result<()> {
        debug_assert!(n > 0);
        loop {
            let current = self.ref_cnt.load(Ordering::Acquire);
            if current == 0 {
                // Resurrection: the buffer was already freed.
                return Err(PoolError::IllegalReferenceCount { count: 0, delta: n });
            }
            let next = current
                .checked_add(n)
                .ok_or(PoolError::IllegalReferenceCount {
                    count: current,
                    delta: n,
                })?;
            if self
                .ref_cnt
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Decrements the count; the winner of the transition to zero runs the
    /// deallocation exactly once. Returns whether that happened here.
    fn release(&self, n: i32) -> Result<bool> {
        debug_assert!(n > 0);
        loop {
            let current = self.ref_cnt.load(Ordering::Acquire);
            if n > current {
                return Err(PoolError::IllegalReferenceCount {
                    count: current,
                    delta: -n,
                });
            }
            if self
                .ref_cnt
                .compare_exchange_weak(current, current - n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if current == n {
                    self.deallocate();
                    return Ok(true);
                }
                return Ok(false);
            }
        }
    }

    fn deallocate(&self) {
        let state = self.state.lock().take();
        if let Some(state) = state {
            // Enqueueing into the owner's cache is legal from any thread;
            // only dequeues are owner-restricted.
            self.arena.free(
                state.chunk,
                state.handle,
                state.max_length,
                state.cache.as_deref(),
            );
        }
        if let Some(tracker) = self.leak.lock().take() {
            tracker.close();
        }
    }

    fn record(&self, hint: &str) {
        if let Some(tracker) = self.leak.lock().as_ref() {
            tracker.record(hint);
        }
    }
}

/// How a buffer object maps onto its shared allocation.
#[derive(Debug, Clone, Copy)]
enum ViewKind {
    Root,
    /// Shares the root's full window; capacity tracks the root.
    Duplicate,
    /// Fixed window `[adjustment, adjustment + length)` of the root.
    Slice { adjustment: usize, length: usize },
}

/// Reference-counted pooled buffer.
#[derive(Debug)]
pub struct PooledByteBuf {
    shared: Arc<BufShared>,
    view: ViewKind,
    max_capacity: usize,
    reader_index: usize,
    writer_index: usize,
    marked_reader_index: usize,
    marked_writer_index: usize,
}

impl PooledByteBuf {
    pub(crate) fn new_root(
        arena: Arc<PoolArena>,
        region: AllocatedRegion,
        cache: Option<Arc<PoolThreadCache>>,
        max_capacity: usize,
        leak: Option<LeakTracker>,
    ) -> Self {
        let state = BufState {
            chunk: region.chunk,
            handle: region.handle,
            offset: region.offset,
            length: region.length,
            max_length: region.max_length,
            cache,
        };
        let shared = recycler::acquire(arena, state, leak);
        Self {
            shared,
            view: ViewKind::Root,
            max_capacity,
            reader_index: 0,
            writer_index: 0,
            marked_reader_index: 0,
            marked_writer_index: 0,
        }
    }

    // ---- reference counting ----

    pub fn ref_cnt(&self) -> i32 {
        self.shared.ref_cnt.load(Ordering::Acquire)
    }

    pub fn retain(&self) -> Result<()> {
        self.shared.retain(1)
    }

    pub fn retain_n(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let n = i32::try_from(n).map_err(|_| PoolError::IllegalReferenceCount {
            count: self.ref_cnt(),
            delta: i32::MAX,
        })?;
        self.shared.retain(n)
    }

    /// Releases one reference. Returns `true` when this call deallocated
    /// the buffer.
    pub fn release(&self) -> Result<bool> {
        self.release_n(1)
    }

    pub fn release_n(&self, n: u32) -> Result<bool> {
        if n == 0 {
            return Ok(false);
        }
        let n = i32::try_from(n).map_err(|_| PoolError::IllegalReferenceCount {
            count: self.ref_cnt(),
            delta: i32::MIN,
        })?;
        let deallocated = self.shared.release(n)?;
        if deallocated {
            recycler::recycle(Arc::clone(&self.shared));
        }
        Ok(deallocated)
    }

    fn ensure_accessible(&self) -> Result<()> {
        let count = self.ref_cnt();
        if count <= 0 {
            return Err(PoolError::IllegalReferenceCount { count, delta: 0 });
        }
        Ok(())
    }

    // ---- capacity and indices ----

    pub fn capacity(&self) -> usize {
        match self.view {
            ViewKind::Slice { length, .. } => length,
            _ => self
                .shared
                .state
                .lock()
                .as_ref()
                .map(|s| s.length)
                .unwrap_or(0),
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.shared.arena.kind()
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer_index
    }

    pub fn is_readable(&self) -> bool {
        self.writer_index > self.reader_index
    }

    pub fn is_writable(&self) -> bool {
        self.capacity() > self.writer_index
    }

    pub fn set_reader_index(&mut self, reader_index: usize) -> Result<()> {
        if reader_index > self.writer_index {
            return Err(PoolError::out_of_range(reader_index, 0, self.writer_index));
        }
        self.reader_index = reader_index;
        Ok(())
    }

    pub fn set_writer_index(&mut self, writer_index: usize) -> Result<()> {
        if writer_index < self.reader_index || writer_index > self.capacity() {
            return Err(PoolError::out_of_range(writer_index, 0, self.capacity()));
        }
        self.writer_index = writer_index;
        Ok(())
    }

    pub fn set_index(&mut self, reader_index: usize, writer_index: usize) -> Result<()> {
        if reader_index > writer_index || writer_index > self.capacity() {
            return Err(PoolError::out_of_range(
                reader_index,
                writer_index.saturating_sub(reader_index),
                self.capacity(),
            ));
        }
        self.reader_index = reader_index;
        self.writer_index = writer_index;
        Ok(())
    }

    /// Resets both indices to zero. The content is untouched.
    pub fn clear(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
    }

    pub fn mark_reader_index(&mut self) {
        self.marked_reader_index = self.reader_index;
    }

    pub fn reset_reader_index(&mut self) -> Result<()> {
        self.set_reader_index(self.marked_reader_index)
    }

    pub fn mark_writer_index(&mut self) {
        self.marked_writer_index = self.writer_index;
    }

    pub fn reset_writer_index(&mut self) -> Result<()> {
        self.set_writer_index(self.marked_writer_index)
    }

    pub fn skip_bytes(&mut self, n: usize) -> Result<()> {
        if self.readable_bytes() < n {
            return Err(PoolError::out_of_range(self.reader_index, n, self.writer_index));
        }
        self.reader_index += n;
        Ok(())
    }

    // ---- memory primitives ----

    /// Runs `f` over the view's bytes at `[index, index + len)`, holding
    /// the shared state lock so a concurrent reallocation cannot move the
    /// memory mid-access.
    fn with_ptr<R>(&self, index: usize, len: usize, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        self.ensure_accessible()?;
        let guard = self.shared.state.lock();
        let state = guard
            .as_ref()
            .ok_or(PoolError::IllegalReferenceCount { count: 0, delta: 0 })?;

        let (adjustment, view_capacity) = match self.view {
            ViewKind::Root | ViewKind::Duplicate => (0, state.length),
            ViewKind::Slice { adjustment, length } => (adjustment, length),
        };
        let end = index
            .checked_add(len)
            .ok_or_else(|| PoolError::out_of_range(index, len, view_capacity))?;
        if end > view_capacity {
            return Err(PoolError::out_of_range(index, len, view_capacity));
        }
        // A slice window can also be cut short by a shrunk parent.
        if adjustment + end > state.length {
            return Err(PoolError::out_of_range(index, len, view_capacity));
        }

        // SAFETY: the range [offset + adjustment + index, +len) is inside
        // this buffer's allocation, which stays valid while the state lock
        // is held and the reference count is positive.
        let ptr = unsafe { state.chunk.base_ptr().add(state.offset + adjustment + index) };
        Ok(f(ptr))
    }

    pub fn get_u8(&self, index: usize) -> Result<u8> {
        // SAFETY: with_ptr bounds the single-byte read.
        self.with_ptr(index, 1, |ptr| unsafe { ptr.read() })
    }

    pub fn set_u8(&self, index: usize, value: u8) -> Result<()> {
        self.shared.record("set_u8");
        // SAFETY: with_ptr bounds the single-byte write.
        self.with_ptr(index, 1, |ptr| unsafe { ptr.write(value) })
    }

    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        // SAFETY: with_ptr bounds the source range; dst length equals it.
        self.with_ptr(index, dst.len(), |ptr| unsafe {
            std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), dst.len());
        })
    }

    pub fn set_bytes(&self, index: usize, src: &[u8]) -> Result<()> {
        self.shared.record("set_bytes");
        // SAFETY: with_ptr bounds the destination range.
        self.with_ptr(index, src.len(), |ptr| unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len());
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if !self.is_readable() {
            return Err(PoolError::out_of_range(self.reader_index, 1, self.writer_index));
        }
        let value = self.get_u8(self.reader_index)?;
        self.reader_index += 1;
        Ok(value)
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.readable_bytes() < dst.len() {
            return Err(PoolError::out_of_range(
                self.reader_index,
                dst.len(),
                self.writer_index,
            ));
        }
        self.get_bytes(self.reader_index, dst)?;
        self.reader_index += dst.len();
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.ensure_writable(1)?;
        self.set_u8(self.writer_index, value)?;
        self.writer_index += 1;
        Ok(())
    }

    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_writable(src.len())?;
        self.set_bytes(self.writer_index, src)?;
        self.writer_index += src.len();
        Ok(())
    }

    /// Copies the readable window into a fresh vector.
    pub fn copy_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.readable_bytes()];
        self.get_bytes(self.reader_index, &mut out)?;
        Ok(out)
    }

    /// Zeroes `len` bytes starting at `index` without touching the
    /// indices.
    pub fn set_zero(&self, index: usize, len: usize) -> Result<()> {
        self.shared.record("set_zero");
        // SAFETY: with_ptr bounds the range being zeroed.
        self.with_ptr(index, len, |ptr| unsafe {
            std::ptr::write_bytes(ptr, 0, len);
        })
    }

    /// Appends `n` zero bytes, growing the capacity as a write would.
    pub fn write_zero(&mut self, n: usize) -> Result<()> {
        self.ensure_writable(n)?;
        self.set_zero(self.writer_index, n)?;
        self.writer_index += n;
        Ok(())
    }

    /// Moves the readable window to the front of the buffer, reclaiming
    /// the space before the reader index for writing. Marked indices shift
    /// with the window, saturating at zero.
    pub fn discard_read_bytes(&mut self) -> Result<()> {
        if self.reader_index == 0 {
            return Ok(());
        }
        self.shared.record("discard_read_bytes");

        let reader = self.reader_index;
        if reader == self.writer_index {
            // Nothing readable: both indices collapse to the front.
            self.marked_reader_index = self.marked_reader_index.saturating_sub(reader);
            self.marked_writer_index = self.marked_writer_index.saturating_sub(reader);
            self.reader_index = 0;
            self.writer_index = 0;
            return Ok(());
        }

        let readable = self.writer_index - reader;
        // SAFETY: source and destination lie inside the checked window;
        // the ranges may overlap, so this is a forward memmove.
        self.with_ptr(0, self.writer_index, |ptr| unsafe {
            std::ptr::copy(ptr.add(reader), ptr, readable);
        })?;

        self.marked_reader_index = self.marked_reader_index.saturating_sub(reader);
        self.marked_writer_index = self.marked_writer_index.saturating_sub(reader);
        self.reader_index = 0;
        self.writer_index = readable;
        Ok(())
    }

    /// Makes room for `n` more writable bytes, growing the capacity when
    /// the view allows it.
    pub fn ensure_writable(&mut self, n: usize) -> Result<()> {
        if self.writable_bytes() >= n {
            return Ok(());
        }
        if matches!(self.view, ViewKind::Slice { .. }) {
            return Err(PoolError::out_of_range(self.writer_index, n, self.capacity()));
        }
        let min_new = self
            .writer_index
            .checked_add(n)
            .ok_or_else(|| PoolError::out_of_range(self.writer_index, n, self.max_capacity))?;
        if min_new > self.max_capacity {
            return Err(PoolError::out_of_range(self.writer_index, n, self.max_capacity));
        }
        let new_capacity = crate::allocator::calculate_new_capacity(min_new, self.max_capacity)?;
        self.adjust_capacity(new_capacity)
    }

    // ---- capacity adjustment ----

    /// Changes the capacity to exactly `new_capacity`, in place when the
    /// underlying run allows it, otherwise by reallocating and copying.
    pub fn adjust_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if matches!(self.view, ViewKind::Slice { .. }) {
            return Err(PoolError::Unsupported {
                operation: "capacity adjustment on a sliced buffer".to_string(),
            });
        }
        self.ensure_accessible()?;
        if new_capacity > self.max_capacity {
            return Err(PoolError::out_of_range(new_capacity, 0, self.max_capacity));
        }
        self.shared.record("adjust_capacity");

        let mut guard = self.shared.state.lock();
        let state = guard
            .as_mut()
            .ok_or(PoolError::IllegalReferenceCount { count: 0, delta: 0 })?;

        if state.chunk.is_unpooled() {
            if new_capacity == state.length {
                return Ok(());
            }
            self.reallocate_locked(state, new_capacity)?;
        } else if new_capacity > state.length {
            if new_capacity <= state.max_length {
                state.length = new_capacity;
                return Ok(());
            }
            self.reallocate_locked(state, new_capacity)?;
        } else if new_capacity < state.length {
            let max_length = state.max_length;
            let in_place = new_capacity > max_length / 2
                && (max_length > 512 || new_capacity > max_length - 16);
            if in_place {
                state.length = new_capacity;
            } else {
                self.reallocate_locked(state, new_capacity)?;
            }
        } else {
            return Ok(());
        }

        drop(guard);
        self.trim_indices_to(new_capacity);
        Ok(())
    }

    fn trim_indices_to(&mut self, capacity: usize) {
        self.writer_index = self.writer_index.min(capacity);
        self.reader_index = self.reader_index.min(self.writer_index);
        self.marked_writer_index = self.marked_writer_index.min(capacity);
        self.marked_reader_index = self.marked_reader_index.min(self.marked_writer_index);
    }

    fn reallocate_locked(&self, state: &mut BufState, new_capacity: usize) -> Result<()> {
        let old = AllocatedRegion {
            chunk: Arc::clone(&state.chunk),
            handle: state.handle,
            offset: state.offset,
            length: state.length,
            max_length: state.max_length,
            size_class: self.shared.arena.size_classes().classify(state.max_length),
        };
        let new_region = self
            .shared
            .arena
            .reallocate(&old, new_capacity, state.cache.as_deref(), true)?;

        state.chunk = new_region.chunk;
        state.handle = new_region.handle;
        state.offset = new_region.offset;
        state.length = new_capacity;
        state.max_length = new_region.max_length;
        Ok(())
    }

    // ---- derived views ----

    /// A view over `[index, index + length)` sharing this buffer's memory
    /// and reference count. Indices are independent; the capacity is fixed.
    pub fn slice(&self, index: usize, length: usize) -> Result<PooledByteBuf> {
        self.ensure_accessible()?;
        let capacity = self.capacity();
        let end = index
            .checked_add(length)
            .ok_or_else(|| PoolError::out_of_range(index, length, capacity))?;
        if end > capacity {
            return Err(PoolError::out_of_range(index, length, capacity));
        }
        self.shared.record("slice");

        let adjustment = match self.view {
            ViewKind::Root | ViewKind::Duplicate => index,
            ViewKind::Slice { adjustment, .. } => adjustment + index,
        };
        Ok(PooledByteBuf {
            shared: Arc::clone(&self.shared),
            view: ViewKind::Slice { adjustment, length },
            max_capacity: length,
            reader_index: 0,
            writer_index: length,
            marked_reader_index: 0,
            marked_writer_index: 0,
        })
    }

    /// Like `slice`, but transfers an extra reference the caller must
    /// release.
    pub fn retained_slice(&self, index: usize, length: usize) -> Result<PooledByteBuf> {
        let slice = self.slice(index, length)?;
        self.shared.retain(1)?;
        Ok(slice)
    }

    /// A view sharing memory and capacity; indices start equal to this
    /// buffer's and move independently afterwards.
    pub fn duplicate(&self) -> Result<PooledByteBuf> {
        self.ensure_accessible()?;
        self.shared.record("duplicate");
        let view = match self.view {
            ViewKind::Root | ViewKind::Duplicate => ViewKind::Duplicate,
            slice @ ViewKind::Slice { .. } => slice,
        };
        Ok(PooledByteBuf {
            shared: Arc::clone(&self.shared),
            view,
            max_capacity: self.max_capacity,
            reader_index: self.reader_index,
            writer_index: self.writer_index,
            marked_reader_index: self.marked_reader_index,
            marked_writer_index: self.marked_writer_index,
        })
    }

    pub fn retained_duplicate(&self) -> Result<PooledByteBuf> {
        let duplicate = self.duplicate()?;
        self.shared.retain(1)?;
        Ok(duplicate)
    }

    /// Slices off the next `length` readable bytes and advances the reader
    /// index past them. The returned slice shares this buffer's count.
    pub fn read_slice(&mut self, length: usize) -> Result<PooledByteBuf> {
        if self.readable_bytes() < length {
            return Err(PoolError::out_of_range(
                self.reader_index,
                length,
                self.writer_index,
            ));
        }
        let slice = self.slice(self.reader_index, length)?;
        self.reader_index += length;
        Ok(slice)
    }

    /// Diagnostic breadcrumb recorded against the leak tracker, if any.
    pub fn touch(&self, hint: &str) {
        self.shared.record(hint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::pool::backing::HeapMemory;

    fn arena() -> Arc<PoolArena> {
        let config = AllocatorConfig {
            heap_arena_count: 1,
            direct_arena_count: 0,
            ..Default::default()
        };
        PoolArena::new(0, Arc::new(HeapMemory), &config)
    }

    fn buf_on(arena: &Arc<PoolArena>, capacity: usize) -> PooledByteBuf {
        let region = arena.allocate(None, capacity).unwrap();
        PooledByteBuf::new_root(Arc::clone(arena), region, None, DEFAULT_MAX_CAPACITY, None)
    }

    #[test]
    fn fresh_buffer_starts_empty() {
        let arena = arena();
        let buf = buf_on(&arena, 256);
        assert_eq!(buf.capacity(), 256);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), 256);
        assert_eq!(buf.ref_cnt(), 1);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn write_then_read_round_trip() {
        let arena = arena();
        let mut buf = buf_on(&arena, 64);
        buf.write_bytes(b"pooled").unwrap();
        assert_eq!(buf.readable_bytes(), 6);

        let mut out = [0u8; 6];
        buf.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"pooled");
        assert!(!buf.is_readable());
        assert!(buf.release().unwrap());
    }

    #[test]
    fn release_retain_identity_on_count() {
        let arena = arena();
        let buf = buf_on(&arena, 64);
        buf.retain().unwrap();
        assert_eq!(buf.ref_cnt(), 2);
        assert!(!buf.release().unwrap());
        assert_eq!(buf.ref_cnt(), 1);
        assert!(buf.release().unwrap());
        assert_eq!(buf.ref_cnt(), 0);
    }

    #[test]
    fn retain_after_free_is_a_resurrection_error() {
        let arena = arena();
        let buf = buf_on(&arena, 64);
        assert!(buf.release().unwrap());
        assert!(matches!(
            buf.retain(),
            Err(PoolError::IllegalReferenceCount { count: 0, .. })
        ));
    }

    #[test]
    fn release_below_zero_is_an_underflow_error() {
        let arena = arena();
        let buf = buf_on(&arena, 64);
        assert!(matches!(
            buf.release_n(2),
            Err(PoolError::IllegalReferenceCount { count: 1, .. })
        ));
        assert_eq!(buf.ref_cnt(), 1);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn retain_at_i32_max_overflows_and_preserves_count() {
        let arena = arena();
        let buf = buf_on(&arena, 64);
        buf.shared.ref_cnt.store(i32::MAX, Ordering::Release);
        assert!(matches!(
            buf.retain(),
            Err(PoolError::IllegalReferenceCount {
                count: i32::MAX,
                ..
            })
        ));
        assert_eq!(buf.ref_cnt(), i32::MAX);
        buf.shared.ref_cnt.store(1, Ordering::Release);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn operations_after_free_fail() {
        let arena = arena();
        let buf = buf_on(&arena, 64);
        assert!(buf.release().unwrap());
        assert!(buf.get_u8(0).is_err());
        assert!(buf.set_u8(0, 1).is_err());
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn slice_sees_parent_writes_at_its_offset() {
        let arena = arena();
        let buf = buf_on(&arena, 1024);
        let slice = buf.slice(0, 512).unwrap();
        let retained = buf.retained_slice(0, 256).unwrap();

        buf.set_u8(100, 0xAB).unwrap();
        assert_eq!(slice.get_u8(100).unwrap(), 0xAB);
        assert_eq!(retained.get_u8(100).unwrap(), 0xAB);

        // Parent release alone does not deallocate: the retained slice
        // still holds a reference.
        assert!(!buf.release().unwrap());
        assert_eq!(buf.ref_cnt(), 1);
        assert!(retained.release().unwrap());
    }

    #[test]
    fn slice_indices_do_not_leak_into_parent() {
        let arena = arena();
        let mut buf = buf_on(&arena, 256);
        buf.write_bytes(&[1, 2, 3, 4]).unwrap();

        let mut slice = buf.slice(0, 4).unwrap();
        let mut out = [0u8; 4];
        slice.read_bytes(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.writer_index(), 4);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn slice_offsets_are_relative_to_the_window() {
        let arena = arena();
        let buf = buf_on(&arena, 256);
        buf.set_u8(10, 0x55).unwrap();
        let slice = buf.slice(10, 16).unwrap();
        assert_eq!(slice.get_u8(0).unwrap(), 0x55);
        // Slices of slices compose their adjustments.
        let inner = slice.slice(0, 8).unwrap();
        assert_eq!(inner.get_u8(0).unwrap(), 0x55);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn slice_capacity_is_fixed() {
        let arena = arena();
        let buf = buf_on(&arena, 256);
        let mut slice = buf.slice(0, 64).unwrap();
        assert_eq!(slice.capacity(), 64);
        assert!(matches!(
            slice.adjust_capacity(128),
            Err(PoolError::Unsupported { .. })
        ));
        assert!(slice.get_u8(64).is_err());
        assert!(buf.release().unwrap());
    }

    #[test]
    fn duplicate_shares_memory_with_independent_indices() {
        let arena = arena();
        let mut buf = buf_on(&arena, 128);
        buf.write_bytes(b"abc").unwrap();

        let mut dup = buf.duplicate().unwrap();
        assert_eq!(dup.reader_index(), 0);
        assert_eq!(dup.writer_index(), 3);

        let mut out = [0u8; 3];
        dup.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"abc");
        assert_eq!(buf.reader_index(), 0);

        dup.clear();
        assert_eq!(buf.writer_index(), 3);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn read_slice_advances_the_reader() {
        let arena = arena();
        let mut buf = buf_on(&arena, 64);
        buf.write_bytes(&[9, 8, 7, 6]).unwrap();
        let slice = buf.read_slice(2).unwrap();
        assert_eq!(buf.reader_index(), 2);
        assert_eq!(slice.get_u8(0).unwrap(), 9);
        assert_eq!(slice.get_u8(1).unwrap(), 8);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn grow_within_run_is_in_place() {
        let arena = arena();
        // 5000 normalizes to a full 8192-byte page.
        let mut buf = buf_on(&arena, 5000);
        buf.write_bytes(b"sticky").unwrap();
        buf.adjust_capacity(8000).unwrap();
        assert_eq!(buf.capacity(), 8000);

        let mut out = [0u8; 6];
        buf.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"sticky");
        assert!(buf.release().unwrap());
    }

    #[test]
    fn grow_past_run_reallocates_and_preserves_content() {
        let arena = arena();
        let mut buf = buf_on(&arena, 1024);
        buf.write_bytes(b"carried").unwrap();
        buf.adjust_capacity(100_000).unwrap();
        assert_eq!(buf.capacity(), 100_000);
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.writer_index(), 7);

        let mut out = [0u8; 7];
        buf.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"carried");
        assert!(buf.release().unwrap());
    }

    #[test]
    fn shrink_clamps_indices() {
        let arena = arena();
        let mut buf = buf_on(&arena, 8192);
        buf.set_index(100, 8000).unwrap();
        buf.adjust_capacity(6000).unwrap();
        assert_eq!(buf.capacity(), 6000);
        assert_eq!(buf.writer_index(), 6000);
        assert_eq!(buf.reader_index(), 100);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn shrink_far_below_the_run_reallocates() {
        let arena = arena();
        let mut buf = buf_on(&arena, 8192);
        buf.write_bytes(b"kept").unwrap();
        // 1000 < 8192 / 2: leaves the page for a smaller run.
        buf.adjust_capacity(1000).unwrap();
        assert_eq!(buf.capacity(), 1000);
        let mut out = [0u8; 4];
        buf.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"kept");
        assert!(buf.release().unwrap());
    }

    #[test]
    fn adjust_capacity_rejects_beyond_max() {
        let arena = arena();
        let region = arena.allocate(None, 64).unwrap();
        let mut buf = PooledByteBuf::new_root(Arc::clone(&arena), region, None, 128, None);
        assert!(matches!(
            buf.adjust_capacity(256),
            Err(PoolError::IndexOutOfRange { .. })
        ));
        assert_eq!(buf.capacity(), 64);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn same_capacity_is_a_noop() {
        let arena = arena();
        let mut buf = buf_on(&arena, 512);
        buf.adjust_capacity(512).unwrap();
        assert_eq!(buf.capacity(), 512);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn ensure_writable_grows_through_the_growth_rule() {
        let arena = arena();
        let mut buf = buf_on(&arena, 64);
        buf.write_bytes(&vec![0u8; 64]).unwrap();
        // Next write doubles 64 -> 128.
        buf.write_u8(1).unwrap();
        assert_eq!(buf.capacity(), 128);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn marks_survive_resets() {
        let arena = arena();
        let mut buf = buf_on(&arena, 64);
        buf.write_bytes(&[1, 2, 3, 4, 5]).unwrap();
        buf.skip_bytes(2).unwrap();
        buf.mark_reader_index();
        buf.skip_bytes(2).unwrap();
        assert_eq!(buf.reader_index(), 4);
        buf.reset_reader_index().unwrap();
        assert_eq!(buf.reader_index(), 2);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn huge_buffer_is_backed_by_an_unpooled_chunk() {
        let arena = arena();
        let size = 16 * 1024 * 1024 + 1;
        let mut buf = buf_on(&arena, size);
        assert_eq!(buf.capacity(), size);
        buf.set_u8(size - 1, 0x7F).unwrap();
        assert_eq!(buf.get_u8(size - 1).unwrap(), 0x7F);
        // Unpooled: any size change reallocates.
        buf.adjust_capacity(1024).unwrap();
        assert_eq!(buf.capacity(), 1024);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn discard_read_bytes_compacts_the_window() {
        let arena = arena();
        let mut buf = buf_on(&arena, 64);
        buf.write_bytes(b"abcdef").unwrap();
        buf.skip_bytes(2).unwrap();
        buf.mark_reader_index();

        buf.discard_read_bytes().unwrap();
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.writer_index(), 4);
        // The mark shifted with the window.
        buf.reset_reader_index().unwrap();
        assert_eq!(buf.reader_index(), 0);

        let mut out = [0u8; 4];
        buf.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"cdef");
        assert!(buf.release().unwrap());
    }

    #[test]
    fn discard_with_nothing_readable_resets_indices() {
        let arena = arena();
        let mut buf = buf_on(&arena, 64);
        buf.write_bytes(b"xyz").unwrap();
        buf.skip_bytes(3).unwrap();
        buf.discard_read_bytes().unwrap();
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.writer_index(), 0);
        assert_eq!(buf.writable_bytes(), 64);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn write_zero_appends_zeroes() {
        let arena = arena();
        let mut buf = buf_on(&arena, 64);
        buf.write_bytes(&[0xFF; 8]).unwrap();
        buf.write_zero(8).unwrap();
        assert_eq!(buf.writer_index(), 16);

        let mut out = [0xEEu8; 16];
        buf.read_bytes(&mut out).unwrap();
        assert_eq!(&out[..8], &[0xFF; 8]);
        assert_eq!(&out[8..], &[0u8; 8]);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn set_zero_is_bounds_checked() {
        let arena = arena();
        let buf = buf_on(&arena, 32);
        buf.set_u8(4, 0x44).unwrap();
        buf.set_zero(0, 32).unwrap();
        assert_eq!(buf.get_u8(4).unwrap(), 0);
        assert!(buf.set_zero(16, 17).is_err());
        assert!(buf.release().unwrap());
    }

    #[test]
    fn small_run_shrink_rule_uses_the_sixteen_byte_margin() {
        let arena = arena();
        // 100 normalizes to 112: max_length 112, below the 512 boundary.
        let mut buf = buf_on(&arena, 100);
        // 100 > 112 - 16: stays in place.
        buf.adjust_capacity(100).unwrap();
        assert_eq!(buf.capacity(), 100);
        buf.adjust_capacity(98).unwrap();
        assert_eq!(buf.capacity(), 98);
        // 90 <= 112 - 16: the shrink reallocates to a 96-byte element.
        buf.adjust_capacity(90).unwrap();
        assert_eq!(buf.capacity(), 90);
        assert!(buf.release().unwrap());

        let counters = arena.metrics().counters();
        assert_eq!(counters.active_allocations(), 0);
    }

    #[test]
    fn concurrent_retain_release_deallocates_exactly_once() {
        let arena = arena();
        let buf = Arc::new(buf_on(&arena, 256));
        for _ in 0..8 {
            buf.retain().unwrap();
        }

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || buf.release().unwrap())
            })
            .collect();
        let deallocations: usize = threads
            .into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();

        // Eight extra references released across threads: none of them
        // hit zero, the count is back at one.
        assert_eq!(deallocations, 0);
        assert_eq!(buf.ref_cnt(), 1);
        assert!(buf.release().unwrap());

        let counters = arena.metrics().counters();
        assert_eq!(counters.active_allocations(), 0);
    }

    #[test]
    fn recycled_shells_are_reused() {
        let arena = arena();
        let buf = buf_on(&arena, 64);
        let shell = Arc::as_ptr(&buf.shared);
        assert!(buf.release().unwrap());
        drop(buf);

        let next = buf_on(&arena, 64);
        assert_eq!(Arc::as_ptr(&next.shared), shell);
        assert_eq!(next.ref_cnt(), 1);
        assert!(next.release().unwrap());
    }
}
