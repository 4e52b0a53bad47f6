// Composite buffer
//
// A bounded sequence of component buffers exposed as one logical byte
// range. Reads and writes locate the owning component for each index and
// delegate; the composite holds one reference to every component and
// releases them all when its own count reaches zero. It is neither a cache
// nor an allocator.

use crate::buffer::PooledByteBuf;
use crate::error::{PoolError, Result};
use crate::leak::LeakTracker;
use std::sync::atomic::{AtomicI32, Ordering};

/// Default bound on the number of components.
pub const DEFAULT_MAX_COMPONENTS: usize = 16;

#[derive(Debug)]
struct Component {
    buf: PooledByteBuf,
    /// First logical index covered by this component.
    offset: usize,
    /// One past the last logical index covered.
    end_offset: usize,
}

/// Reference-counted sequence of pooled buffers.
#[derive(Debug)]
pub struct CompositeByteBuf {
    max_components: usize,
    components: Vec<Component>,
    ref_cnt: AtomicI32,
    reader_index: usize,
    writer_index: usize,
    leak: Option<LeakTracker>,
}

impl CompositeByteBuf {
    pub(crate) fn new(max_components: usize, leak: Option<LeakTracker>) -> Self {
        Self {
            max_components,
            components: Vec::new(),
            ref_cnt: AtomicI32::new(1),
            reader_index: 0,
            writer_index: 0,
            leak,
        }
    }

    pub fn max_components(&self) -> usize {
        self.max_components
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Total logical capacity: the sum of the components' readable spans.
    pub fn capacity(&self) -> usize {
        self.components.last().map(|c| c.end_offset).unwrap_or(0)
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

    pub fn ref_cnt(&self) -> i32 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    /// Appends a component covering the buffer's readable window. The
    /// composite takes over the caller's reference and extends its writer
    /// index past the new bytes.
    pub fn add_component(&mut self, buf: PooledByteBuf) -> Result<()> {
        self.ensure_accessible()?;
        if self.components.len() == self.max_components {
            // Ownership of the rejected buffer stays with the composite
            // call: release it rather than stranding the reference.
            buf.release()?;
            return Err(PoolError::InvalidArgument {
                reason: format!(
                    "composite already holds the maximum of {} components",
                    self.max_components
                ),
            });
        }
        if let Some(tracker) = &self.leak {
            tracker.record("add_component");
        }

        let offset = self.capacity();
        let end_offset = offset + buf.readable_bytes();
        self.components.push(Component {
            buf,
            offset,
            end_offset,
        });
        self.writer_index = end_offset;
        Ok(())
    }

    fn ensure_accessible(&self) -> Result<()> {
        let count = self.ref_cnt();
        if count <= 0 {
            return Err(PoolError::IllegalReferenceCount { count, delta: 0 });
        }
        Ok(())
    }

    /// Component covering a logical index.
    fn component_for(&self, index: usize) -> Result<&Component> {
        let capacity = self.capacity();
        if index >= capacity {
            return Err(PoolError::out_of_range(index, 1, capacity));
        }
        let position = self
            .components
            .partition_point(|c| c.end_offset <= index);
        Ok(&self.components[position])
    }

    pub fn get_u8(&self, index: usize) -> Result<u8> {
        self.ensure_accessible()?;
        let component = self.component_for(index)?;
        let inner_index = component.buf.reader_index() + (index - component.offset);
        component.buf.get_u8(inner_index)
    }

    pub fn set_u8(&self, index: usize, value: u8) -> Result<()> {
        self.ensure_accessible()?;
        let component = self.component_for(index)?;
        let inner_index = component.buf.reader_index() + (index - component.offset);
        component.buf.set_u8(inner_index, value)
    }

    /// Copies out `dst.len()` bytes starting at `index`, walking across
    /// component boundaries.
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.ensure_accessible()?;
        let end = index
            .checked_add(dst.len())
            .ok_or_else(|| PoolError::out_of_range(index, dst.len(), self.capacity()))?;
        if end > self.capacity() {
            return Err(PoolError::out_of_range(index, dst.len(), self.capacity()));
        }

        let mut copied = 0;
        let mut cursor = index;
        while copied < dst.len() {
            let component = self.component_for(cursor)?;
            let inner_index = component.buf.reader_index() + (cursor - component.offset);
            let available = component.end_offset - cursor;
            let take = available.min(dst.len() - copied);
            component
                .buf
                .get_bytes(inner_index, &mut dst[copied..copied + take])?;
            copied += take;
            cursor += take;
        }
        Ok(())
    }

    /// Copies `src` into the composite starting at `index`, walking across
    /// component boundaries.
    pub fn set_bytes(&self, index: usize, src: &[u8]) -> Result<()> {
        self.ensure_accessible()?;
        let end = index
            .checked_add(src.len())
            .ok_or_else(|| PoolError::out_of_range(index, src.len(), self.capacity()))?;
        if end > self.capacity() {
            return Err(PoolError::out_of_range(index, src.len(), self.capacity()));
        }

        let mut written = 0;
        let mut cursor = index;
        while written < src.len() {
            let component = self.component_for(cursor)?;
            let inner_index = component.buf.reader_index() + (cursor - component.offset);
            let available = component.end_offset - cursor;
            let take = available.min(src.len() - written);
            component
                .buf
                .set_bytes(inner_index, &src[written..written + take])?;
            written += take;
            cursor += take;
        }
        Ok(())
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

    pub fn skip_bytes(&mut self, n: usize) -> Result<()> {
        if self.readable_bytes() < n {
            return Err(PoolError::out_of_range(self.reader_index, n, self.writer_index));
        }
        self.reader_index += n;
        Ok(())
    }

    pub fn retain(&self) -> Result<()> {
        loop {
            let current = self.ref_cnt.load(Ordering::Acquire);
            if current == 0 {
                return Err(PoolError::IllegalReferenceCount { count: 0, delta: 1 });
            }
            let next = current
                .checked_add(1)
                .ok_or(PoolError::IllegalReferenceCount {
                    count: current,
                    delta: 1,
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

    /// Releases one reference; on the transition to zero every component
    /// is released and the component list cleared.
    pub fn release(&mut self) -> Result<bool> {
        let current = self.ref_cnt.load(Ordering::Acquire);
        if current == 0 {
            return Err(PoolError::IllegalReferenceCount {
                count: 0,
                delta: -1,
            });
        }
        let remaining = current - 1;
        self.ref_cnt.store(remaining, Ordering::Release);
        if remaining > 0 {
            return Ok(false);
        }

        for component in self.components.drain(..) {
            component.buf.release()?;
        }
        if let Some(tracker) = self.leak.take() {
            tracker.close();
        }
        Ok(true)
    }

    /// Diagnostic breadcrumb recorded against the leak tracker, if any.
    pub fn touch(&self, hint: &str) {
        if let Some(tracker) = &self.leak {
            tracker.touch(hint);
        }
    }
}
