//! Per-thread capture entry points
//!
//! The instrumentation engine drives one [`ThreadTracer`] per OS thread:
//!
//! - `on_block` once per basic-block compilation (raw-byte map)
//! - `on_instruction` once per executed instruction
//! - `on_signal` when a signal reaches the thread
//! - `on_fork_child` in the child right after a fork
//! - `finish` on thread exit
//!
//! For every executed instruction the memory-access details are appended
//! first, then the instruction reference, the memory-reference count and the
//! register snapshot, so the Nth record of the instruction, count and
//! register streams always describe the same dynamic instruction.
//!
//! A fatal error (failed flush, malformed record) aborts tracing for the whole
//! process: the error is returned once to the thread that hit it, and later
//! calls on every tracer of the process are no-ops so the traced program
//! keeps running untraced.

use nix::sys::signal::Signal;
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::context::ProcessContext;
use crate::error::{Result, TraceError};
use crate::flush;
use crate::fork;
use crate::host::{BlockInstruction, InstructionEvent, InstrumentationHost};
use crate::record::{
    DecodeRecord, FixedRecord, InstructionRef, InstructionRef32, MemoryAccessDetail, MemoryReferenceCount,
    RawByteMapEntry, StreamKind,
};
use crate::session::{self, TraceSession};
use crate::signal::{SignalAction, SignalFlushGuard};

/// Instructions of one compiled block recorded in the raw-byte map
pub const MAX_BLOCK_INSTRUCTIONS: usize = 128;

/// Recording state of a thread tracer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Active,
    Aborted,
}

/// Capture front end owned by one traced thread
pub struct ThreadTracer<H: InstrumentationHost> {
    ctx: Arc<ProcessContext>,
    host: H,
    tid: u32,
    pool: BufferPool,
    /// `None` once a forked child has dropped the parent's session
    session: Option<TraceSession>,
    guard: SignalFlushGuard,
    state: TracerState,
}

impl<H: InstrumentationHost> ThreadTracer<H> {
    /// Open a session for thread `tid` and allocate its buffers
    pub fn start(ctx: Arc<ProcessContext>, tid: u32, host: H) -> Result<Self> {
        let session = session::open_session(&ctx, tid, &host)?;
        let pool = BufferPool::new(&ctx.config().capacities, ctx.layout());
        Ok(Self {
            ctx,
            host,
            tid,
            pool,
            session: Some(session),
            guard: SignalFlushGuard::new(),
            state: TracerState::Active,
        })
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// `Aborted` once this thread or any other thread of the process hit a
    /// fatal error
    pub fn state(&self) -> TracerState {
        if self.ctx.is_aborted() {
            TracerState::Aborted
        } else {
            self.state
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TracerState::Aborted
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.ctx
    }

    pub fn session(&self) -> Option<&TraceSession> {
        self.session.as_ref()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn signal_guard(&self) -> &SignalFlushGuard {
        &self.guard
    }

    /// Instructions already flushed to this thread's instruction stream
    pub fn flushed_instructions(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, TraceSession::instruction_count)
    }

    /// Record the raw bytes of a freshly compiled basic block
    ///
    /// At most the first [`MAX_BLOCK_INSTRUCTIONS`] instructions of the block
    /// are recorded, whatever the raw-byte-map buffer capacity.
    pub fn on_block(&mut self, block: &[BlockInstruction]) -> Result<()> {
        if self.is_aborted() {
            return Ok(());
        }
        if block.len() > MAX_BLOCK_INSTRUCTIONS {
            tracing::debug!(
                "Block at {:#x} has {} instructions, recording the first {}",
                block[0].address,
                block.len(),
                MAX_BLOCK_INSTRUCTIONS
            );
        }
        let result = block.iter().take(MAX_BLOCK_INSTRUCTIONS).try_for_each(|insn| {
            let entry = RawByteMapEntry::new(insn.address, &insn.raw_bytes)?;
            self.push(&entry)
        });
        self.check(result)
    }

    /// Record one executed instruction
    pub fn on_instruction(&mut self, event: &InstructionEvent<'_>) -> Result<()> {
        if self.is_aborted() {
            return Ok(());
        }
        let result = self.record_instruction(event);
        self.check(result)
    }

    fn record_instruction(&mut self, event: &InstructionEvent<'_>) -> Result<()> {
        for operand in event.operands {
            self.push(&MemoryAccessDetail {
                addr: operand.address,
                value: 0,
                size: operand.size,
                direction: operand.direction,
                pc: event.address,
            })?;
        }
        self.push_instruction(event.address)?;
        self.push(&MemoryReferenceCount {
            length: event.operands.len() as u64,
        })?;

        let layout = *self.ctx.layout();
        let mut regs = self.host.capture_registers(&layout);
        if !regs.matches(&layout) {
            return Err(TraceError::MalformedRecord {
                stream: StreamKind::Register,
                expected: layout.record_size(),
                actual: regs.encoded_len(),
            });
        }
        regs.set_next_pc(event.next_address());
        self.push(&regs)
    }

    /// Drain all five buffers now
    pub fn flush(&mut self) -> Result<()> {
        if self.is_aborted() {
            return Ok(());
        }
        let result = match self.session.as_mut() {
            Some(session) => flush::flush_all(&self.ctx, session, &mut self.pool),
            None => Ok(()),
        };
        self.check(result)
    }

    /// Handle a signal delivered to this thread; always returns `Deliver`
    pub fn on_signal(&mut self, signal: Signal) -> SignalAction {
        if self.is_aborted() {
            return SignalAction::Deliver;
        }
        match self.session.as_mut() {
            Some(session) => self.guard.on_signal(signal, &self.ctx, session, &mut self.pool),
            None => SignalAction::Deliver,
        }
    }

    /// Continue tracing in a freshly forked child process
    ///
    /// The inherited buffers and session are discarded without being
    /// flushed; `child_tid` is the forking thread's id in the child. If the
    /// child's state cannot be built, tracing stays aborted in the child and
    /// nothing inherited is ever written.
    pub fn on_fork_child(&mut self, child_tid: u32) -> Result<()> {
        self.session = None;
        self.pool.discard();
        self.tid = child_tid;
        self.guard = SignalFlushGuard::new();

        match fork::rebuild_in_child(&self.ctx, child_tid, &self.host) {
            Ok(forked) => {
                self.ctx = forked.ctx;
                self.pool = forked.pool;
                self.session = Some(forked.session);
                self.state = TracerState::Active;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Tracing aborted in forked child thread {}: {}", child_tid, e);
                self.state = TracerState::Aborted;
                Err(e)
            }
        }
    }

    /// Close the session on thread exit; returns this thread's instruction count
    ///
    /// Pending records are flushed only while the process is still tracing.
    pub fn finish(self) -> Result<u64> {
        let flush_pending = !self.is_aborted();
        let Self {
            ctx,
            mut pool,
            session,
            ..
        } = self;
        match session {
            Some(session) => session::close_session(&ctx, session, &mut pool, flush_pending),
            None => Ok(0),
        }
    }

    /// Append a pointer-width instruction record
    fn push_instruction(&mut self, pc: u64) -> Result<()> {
        if InstructionRef::record_size(self.ctx.layout().arch) == InstructionRef32::SIZE {
            let pc = u32::try_from(pc).map_err(|_| TraceError::MalformedRecord {
                stream: StreamKind::Instruction,
                expected: InstructionRef32::SIZE,
                actual: InstructionRef::SIZE,
            })?;
            self.push(&InstructionRef32 { pc })
        } else {
            self.push(&InstructionRef { pc })
        }
    }

    fn push<R: FixedRecord>(&mut self, record: &R) -> Result<()> {
        let Self {
            ctx, pool, session, ..
        } = self;
        let Some(session) = session.as_mut() else {
            return Ok(());
        };
        pool.append(record, |full| flush::flush(ctx, session, full).map(drop))
    }

    fn check(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.state = TracerState::Aborted;
                if self.ctx.abort() {
                    tracing::error!(
                        "Tracing aborted for process {} by thread {}: {}",
                        self.ctx.pid(),
                        self.tid,
                        e
                    );
                }
            }
        }
        result
    }
}
