//! Fixed-capacity per-stream trace buffers
//!
//! Each thread owns one [`BufferPool`]: five [`TraceBuffer`]s, one per
//! stream, each a flat byte array of `capacity` slots of the stream's record
//! size plus a write cursor. Appending to a full buffer first hands the whole
//! buffer to an overflow callback (the flush dispatcher), then resets the
//! cursor and writes the record into slot zero. Buffers never grow.
//!
//! # Design
//!
//! ```text
//! capture callback ──► append(record)
//!                        │ full? ──► on_full(&buffer) ──► write(file) ; cursor = 0
//!                        ▼
//!                   slot[cursor] = record ; cursor += 1
//! ```

use crate::arch::RegisterLayout;
use crate::config::BufferCapacities;
use crate::error::{Result, TraceError};
use crate::record::{
    DecodeRecord, FixedRecord, InstructionRef, MemoryAccessDetail, MemoryReferenceCount,
    RawByteMapEntry, StreamKind,
};

/// Fixed-capacity buffer of homogeneous fixed-size records
pub struct TraceBuffer {
    kind: StreamKind,
    record_size: usize,
    capacity: usize,
    data: Box<[u8]>,
    /// Number of records currently held; never exceeds `capacity`
    cursor: usize,
    total_appended: u64,
    total_flushes: u64,
}

impl TraceBuffer {
    /// Create a buffer holding `capacity` records of `record_size` bytes
    ///
    /// # Panics
    ///
    /// Panics if capacity or record size is 0.
    pub fn new(kind: StreamKind, record_size: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "Trace buffer capacity must be > 0");
        assert!(record_size > 0, "Trace buffer record size must be > 0");

        Self {
            kind,
            record_size,
            capacity,
            data: vec![0u8; record_size * capacity].into_boxed_slice(),
            cursor: 0,
            total_appended: 0,
            total_flushes: 0,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn is_full(&self) -> bool {
        self.cursor == self.capacity
    }

    /// Bytes of all records appended since the last reset, in order
    pub fn contents(&self) -> &[u8] {
        &self.data[..self.cursor * self.record_size]
    }

    /// Drop all held records
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Record that the current contents were drained, then reset
    pub fn mark_flushed(&mut self) {
        self.total_flushes += 1;
        self.reset();
    }

    /// Append one record, draining through `on_full` first if the buffer is full
    ///
    /// Fails only when the record's encoded size does not match this stream,
    /// or when the overflow callback fails; in both cases nothing is written.
    pub fn append<R, F>(&mut self, record: &R, on_full: F) -> Result<()>
    where
        R: FixedRecord,
        F: FnOnce(&TraceBuffer) -> Result<()>,
    {
        let actual = record.encoded_len();
        if R::STREAM != self.kind || actual != self.record_size {
            return Err(TraceError::MalformedRecord {
                stream: self.kind,
                expected: self.record_size,
                actual,
            });
        }
        self.make_room(on_full)?;
        record.write_to(self.next_slot());
        self.advance();
        Ok(())
    }

    /// Decode the held records of a fixed-layout stream
    pub fn records<'a, R: DecodeRecord + 'a>(&'a self) -> impl Iterator<Item = R> + 'a {
        self.contents()
            .chunks_exact(self.record_size)
            .filter_map(R::decode)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            total_appended: self.total_appended,
            total_flushes: self.total_flushes,
            current_size: self.cursor,
            capacity: self.capacity,
        }
    }

    fn make_room<F>(&mut self, on_full: F) -> Result<()>
    where
        F: FnOnce(&TraceBuffer) -> Result<()>,
    {
        if self.is_full() {
            on_full(self)?;
            self.mark_flushed();
        }
        Ok(())
    }

    fn next_slot(&mut self) -> &mut [u8] {
        let start = self.cursor * self.record_size;
        &mut self.data[start..start + self.record_size]
    }

    fn advance(&mut self) {
        self.cursor += 1;
        self.total_appended += 1;
    }
}

/// Buffer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub total_appended: u64,
    pub total_flushes: u64,
    pub current_size: usize,
    pub capacity: usize,
}

/// The five per-thread stream buffers
pub struct BufferPool {
    buffers: [TraceBuffer; 5],
}

impl BufferPool {
    /// Allocate five empty buffers sized for `layout`
    ///
    /// Instruction records are pointer-width and register records take the
    /// layout's size; the other streams are fixed.
    pub fn new(capacities: &BufferCapacities, layout: &RegisterLayout) -> Self {
        let make = |kind: StreamKind| {
            let record_size = match kind {
                StreamKind::Instruction => InstructionRef::record_size(layout.arch),
                StreamKind::Register => layout.record_size(),
                StreamKind::MemoryCount => MemoryReferenceCount::SIZE,
                StreamKind::MemoryDetail => MemoryAccessDetail::SIZE,
                StreamKind::RawByteMap => RawByteMapEntry::SIZE,
            };
            TraceBuffer::new(kind, record_size, capacities.for_stream(kind))
        };
        Self {
            buffers: StreamKind::ALL.map(make),
        }
    }

    pub fn get(&self, kind: StreamKind) -> &TraceBuffer {
        &self.buffers[kind.index()]
    }

    pub fn get_mut(&mut self, kind: StreamKind) -> &mut TraceBuffer {
        &mut self.buffers[kind.index()]
    }

    /// Append a record to the buffer of its stream
    pub fn append<R, F>(&mut self, record: &R, on_full: F) -> Result<()>
    where
        R: FixedRecord,
        F: FnOnce(&TraceBuffer) -> Result<()>,
    {
        self.get_mut(R::STREAM).append(record, on_full)
    }

    /// Drop every held record without flushing
    pub fn discard(&mut self) {
        self.buffers.iter_mut().for_each(TraceBuffer::reset);
    }

    /// Records held across all five buffers
    pub fn pending_records(&self) -> usize {
        self.buffers.iter().map(TraceBuffer::len).sum()
    }
}
