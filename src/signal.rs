//! Best-effort flush on fatal signals
//!
//! When SIGINT, SIGABRT or SIGSEGV reaches a traced thread, every buffer of
//! that thread is drained and its session files are synced before the signal
//! continues to the program's own handler. The signal is always delivered,
//! whether or not the emergency flush succeeded.
//!
//! ```text
//! Running ──(fatal signal)──► Flushing ──(flush done/skipped)──► Running + deliver
//! ```
//!
//! The flush takes the process-wide lock through
//! [`ProcessContext::try_lock_for_signal`]: if the interrupted thread already
//! holds it (a normal flush was in progress), or the lock stays contended,
//! the emergency flush is skipped rather than risking a self-deadlock.

use nix::sys::signal::Signal;
use std::fmt;
use std::io::Write;

use crate::buffer::BufferPool;
use crate::context::{LockAttempt, ProcessContext};
use crate::flush;
use crate::session::TraceSession;

/// What the engine should do with the signal after the guard has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Deliver the signal to the application unchanged
    Deliver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Running,
    Flushing,
}

/// Signals that trigger an emergency flush
pub fn is_fatal(signal: Signal) -> bool {
    matches!(signal, Signal::SIGINT | Signal::SIGABRT | Signal::SIGSEGV)
}

/// Result of one emergency flush attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Buffers drained and files synced
    Flushed { records: usize },
    /// The delivering thread was already inside the lock
    SkippedReentrant,
    /// The lock stayed held by another thread
    SkippedContended,
    Failed(String),
}

impl fmt::Display for FlushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flushed { records } => write!(f, "flushed {} records", records),
            Self::SkippedReentrant => write!(f, "skipped (thread already flushing)"),
            Self::SkippedContended => write!(f, "skipped (lock contended)"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-thread guard driving the emergency-flush state machine
#[derive(Debug)]
pub struct SignalFlushGuard {
    state: GuardState,
    last_outcome: Option<FlushOutcome>,
}

impl Default for SignalFlushGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalFlushGuard {
    pub fn new() -> Self {
        Self {
            state: GuardState::Running,
            last_outcome: None,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn last_outcome(&self) -> Option<&FlushOutcome> {
        self.last_outcome.as_ref()
    }

    /// Handle a signal delivered to the thread owning `session` and `pool`
    pub fn on_signal(
        &mut self,
        signal: Signal,
        ctx: &ProcessContext,
        session: &mut TraceSession,
        pool: &mut BufferPool,
    ) -> SignalAction {
        if !is_fatal(signal) {
            return SignalAction::Deliver;
        }
        tracing::warn!("Signal {} caught on thread {}", signal, session.tid());

        let outcome = if self.state == GuardState::Flushing {
            FlushOutcome::SkippedReentrant
        } else {
            self.state = GuardState::Flushing;
            let outcome = emergency_flush(ctx, session, pool);
            self.state = GuardState::Running;
            outcome
        };

        match &outcome {
            FlushOutcome::Flushed { .. } => tracing::info!("Emergency flush: {}", outcome),
            _ => tracing::error!("Emergency flush: {}", outcome),
        }
        self.last_outcome = Some(outcome);
        SignalAction::Deliver
    }
}

/// Drain every buffer of the thread and sync its files
pub fn emergency_flush(
    ctx: &ProcessContext,
    session: &mut TraceSession,
    pool: &mut BufferPool,
) -> FlushOutcome {
    let mut shared = match ctx.try_lock_for_signal(session.tid()) {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::HeldBySelf => return FlushOutcome::SkippedReentrant,
        LockAttempt::Contended => return FlushOutcome::SkippedContended,
    };

    let records = match flush::flush_all_locked(&mut shared, session, pool) {
        Ok(records) => records,
        Err(e) => return FlushOutcome::Failed(e.to_string()),
    };
    let synced = session
        .sync_all()
        .and_then(|_| shared.bytemap.flush())
        .and_then(|_| shared.bytemap.sync_all());
    match synced {
        Ok(()) => FlushOutcome::Flushed { records },
        Err(e) => FlushOutcome::Failed(format!("sync: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TraceBuffer;
    use crate::config::{BufferCapacities, TraceConfig};
    use crate::error::Result;
    use crate::record::{InstructionRef, StreamKind};
    use crate::session::open_session;
    use crate::synthetic::SyntheticHost;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<ProcessContext>, TraceSession, BufferPool) {
        let host = SyntheticHost::new(900, 1, "sig");
        let config = TraceConfig {
            output_dir: dir.path().to_path_buf(),
            capacities: BufferCapacities::uniform(16),
            ..TraceConfig::default()
        };
        let ctx = ProcessContext::initialize(config, &host).unwrap();
        let session = open_session(&ctx, 900, &host).unwrap();
        let pool = BufferPool::new(&ctx.config().capacities, ctx.layout());
        (ctx, session, pool)
    }

    fn no_flush(_: &TraceBuffer) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_fatal_signal_set() {
        assert!(is_fatal(Signal::SIGSEGV));
        assert!(is_fatal(Signal::SIGABRT));
        assert!(is_fatal(Signal::SIGINT));
        assert!(!is_fatal(Signal::SIGCHLD));
    }

    #[test]
    fn test_fatal_signal_flushes_pending_records() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut session, mut pool) = setup(&dir);
        for pc in 0..5u64 {
            pool.append(&InstructionRef { pc }, no_flush).unwrap();
        }
        let mut guard = SignalFlushGuard::new();
        let action = guard.on_signal(Signal::SIGSEGV, &ctx, &mut session, &mut pool);

        assert_eq!(action, SignalAction::Deliver);
        assert_eq!(guard.state(), GuardState::Running);
        assert_eq!(
            guard.last_outcome(),
            Some(&FlushOutcome::Flushed { records: 5 })
        );
        let bytes = fs::read(session.stream_path(StreamKind::Instruction)).unwrap();
        assert_eq!(bytes.len(), 5 * 8);
    }

    #[test]
    fn test_non_fatal_signal_is_passed_through() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut session, mut pool) = setup(&dir);
        pool.append(&InstructionRef { pc: 1 }, no_flush).unwrap();
        let mut guard = SignalFlushGuard::new();
        let action = guard.on_signal(Signal::SIGCHLD, &ctx, &mut session, &mut pool);
        assert_eq!(action, SignalAction::Deliver);
        assert!(guard.last_outcome().is_none());
        assert_eq!(pool.pending_records(), 1);
    }

    #[test]
    fn test_signal_during_own_flush_skips() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut session, mut pool) = setup(&dir);
        pool.append(&InstructionRef { pc: 1 }, no_flush).unwrap();

        // the delivering thread is mid-way through a normal flush
        let held = ctx.lock(session.tid());
        let outcome = emergency_flush(&ctx, &mut session, &mut pool);
        drop(held);

        assert_eq!(outcome, FlushOutcome::SkippedReentrant);
        assert_eq!(pool.pending_records(), 1);
        let bytes = fs::read(session.stream_path(StreamKind::Instruction)).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_signal_still_delivered_when_contended() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut session, mut pool) = setup(&dir);
        let held = ctx.lock(session.tid() + 1);
        let mut guard = SignalFlushGuard::new();
        let action = guard.on_signal(Signal::SIGABRT, &ctx, &mut session, &mut pool);
        drop(held);

        assert_eq!(action, SignalAction::Deliver);
        assert_eq!(guard.last_outcome(), Some(&FlushOutcome::SkippedContended));
    }
}
