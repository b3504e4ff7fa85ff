//! Process-wide tracing context
//!
//! One [`ProcessContext`] exists per traced process. It is created when
//! tracing starts (or rebuilt in a forked child) and shared by every thread
//! tracer of the process through an `Arc`. It owns the only lock in the
//! recorder, which serializes:
//!
//! - writes to the shared raw-byte map
//! - appends to the process-tree log
//! - the aggregate instruction total
//! - session and directory creation
//! - every buffer flush
//!
//! The lock records the thread id of its holder so that the fatal-signal path
//! can detect that it interrupted its own thread mid-flush and skip instead of
//! deadlocking.
//!
//! A fatal error in any thread aborts tracing for the whole process: every
//! thread tracer checks [`ProcessContext::is_aborted`] before recording.

use std::collections::HashSet;
use std::fs::{self, File};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use crate::arch::RegisterLayout;
use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::fork::ProcessTreeLog;
use crate::host::InstrumentationHost;
use crate::record::{ProcessTreeEntry, StreamKind, FORMAT_VERSION};
use crate::session;

/// Attempts the signal path makes before giving up on a contended lock
const SIGNAL_LOCK_ATTEMPTS: u32 = 500;
const SIGNAL_LOCK_BACKOFF: Duration = Duration::from_micros(200);

/// State guarded by the process-wide lock
#[derive(Debug)]
pub struct SharedState {
    /// Raw-byte map shared by all threads of the process
    pub(crate) bytemap: File,
    /// Instructions recorded by threads that have already exited
    pub(crate) total_instructions: u64,
    /// Sessions opened by this process so far
    pub(crate) sessions_opened: usize,
    /// Threads with a live session
    pub(crate) live_threads: HashSet<u32>,
}

/// Exclusive access to [`SharedState`]; clears the owner on drop
pub struct SharedGuard<'a> {
    state: MutexGuard<'a, SharedState>,
    owner: &'a AtomicU32,
}

impl Deref for SharedGuard<'_> {
    type Target = SharedState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for SharedGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::SeqCst);
    }
}

/// Outcome of a lock attempt from the fatal-signal path
pub enum LockAttempt<'a> {
    Acquired(SharedGuard<'a>),
    /// The calling thread already holds the lock
    HeldBySelf,
    /// Another thread held the lock for the whole retry window
    Contended,
}

/// Process-wide tracing state
#[derive(Debug)]
pub struct ProcessContext {
    config: TraceConfig,
    layout: RegisterLayout,
    trace_root: PathBuf,
    pid: u32,
    root_pid: u32,
    shared: Mutex<SharedState>,
    /// Thread id holding `shared`, 0 when free
    lock_owner: AtomicU32,
    aborted: AtomicBool,
}

impl ProcessContext {
    /// Start a tracing run in the root process
    ///
    /// Creates the trace root, the shared raw-byte map and the process-tree
    /// log. Any failure here is fatal for the whole run.
    pub fn initialize<H: InstrumentationHost>(config: TraceConfig, host: &H) -> Result<Arc<Self>> {
        config.validate()?;
        let arch = host.arch();
        let layout = RegisterLayout::new(arch, config.store_simd, config.store_fxsave)?;
        let root_pid = host.process_id();
        let app = host.application_name();

        tracing::info!("{} - tracer initializing", arch);
        tracing::info!("Binary being traced: {}", app);
        tracing::info!("Number of SIMD slots: {}", arch.simd_slots());
        tracing::info!("Trace format version: {}", FORMAT_VERSION);

        let trace_root = session::create_trace_root(&config.output_dir, &app, root_pid)?;
        let bytemap = open_bytemap(&trace_root)?;
        ProcessTreeLog::create(
            &trace_root,
            ProcessTreeEntry {
                parent: host.parent_process_id(),
                child: root_pid,
            },
        )?;

        Ok(Arc::new(Self::build(
            config, layout, trace_root, root_pid, root_pid, bytemap,
        )))
    }

    /// Fresh context for a forked child continuing the parent's run
    ///
    /// Nothing is inherited but configuration and the trace root: the lock,
    /// the counters and the raw-byte map handle are all new.
    pub fn for_forked_child(&self, child_pid: u32) -> Result<Arc<Self>> {
        let bytemap = open_bytemap(&self.trace_root)?;
        Ok(Arc::new(Self::build(
            self.config.clone(),
            self.layout,
            self.trace_root.clone(),
            child_pid,
            self.root_pid,
            bytemap,
        )))
    }

    fn build(
        config: TraceConfig,
        layout: RegisterLayout,
        trace_root: PathBuf,
        pid: u32,
        root_pid: u32,
        bytemap: File,
    ) -> Self {
        Self {
            config,
            layout,
            trace_root,
            pid,
            root_pid,
            shared: Mutex::new(SharedState {
                bytemap,
                total_instructions: 0,
                sessions_opened: 0,
                live_threads: HashSet::new(),
            }),
            lock_owner: AtomicU32::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    pub fn trace_root(&self) -> &Path {
        &self.trace_root
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn root_pid(&self) -> u32 {
        self.root_pid
    }

    pub fn is_root_process(&self) -> bool {
        self.pid == self.root_pid
    }

    /// Stop tracing in every thread of this process
    ///
    /// Returns `true` for the call that moved the process into the aborted
    /// state.
    pub fn abort(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Directory holding this process's sessions
    pub fn process_dir(&self) -> PathBuf {
        self.trace_root.join(self.pid.to_string())
    }

    /// Acquire the process-wide lock on behalf of thread `tid`
    pub fn lock(&self, tid: u32) -> SharedGuard<'_> {
        let state = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        self.lock_owner.store(tid, Ordering::SeqCst);
        SharedGuard {
            state,
            owner: &self.lock_owner,
        }
    }

    /// Acquire the lock from the fatal-signal path without self-deadlock
    ///
    /// Returns [`LockAttempt::HeldBySelf`] if `tid` already holds the lock and
    /// [`LockAttempt::Contended`] if the retry window runs out.
    pub fn try_lock_for_signal(&self, tid: u32) -> LockAttempt<'_> {
        for _ in 0..SIGNAL_LOCK_ATTEMPTS {
            if self.lock_owner.load(Ordering::SeqCst) == tid {
                return LockAttempt::HeldBySelf;
            }
            let state = match self.shared.try_lock() {
                Ok(state) => state,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    std::thread::sleep(SIGNAL_LOCK_BACKOFF);
                    continue;
                }
            };
            self.lock_owner.store(tid, Ordering::SeqCst);
            return LockAttempt::Acquired(SharedGuard {
                state,
                owner: &self.lock_owner,
            });
        }
        LockAttempt::Contended
    }

    /// Instructions recorded by exited threads of this process
    pub fn total_instructions(&self) -> u64 {
        self.lock(0).total_instructions
    }

    /// Report the process exit and return the aggregate instruction count
    pub fn finish(&self) -> u64 {
        let total = {
            let shared = self.lock(0);
            if !shared.live_threads.is_empty() {
                tracing::warn!(
                    "{} thread session(s) still open at process exit",
                    shared.live_threads.len()
                );
            }
            shared.total_instructions
        };
        let role = if self.is_root_process() {
            "Parent"
        } else {
            "Child"
        };
        tracing::info!(
            "{} process (PID:{}) exits. Total number of instructions seen: {}",
            role,
            self.pid,
            total
        );
        total
    }
}

/// Open the run-wide raw-byte map for appending
fn open_bytemap(trace_root: &Path) -> Result<File> {
    let path = trace_root.join(StreamKind::RawByteMap.file_name());
    let file = File::options()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| TraceError::SessionCreation {
            path: path.clone(),
            source,
        })?;
    make_world_accessible(&path);
    Ok(file)
}

/// Run-level files are shared by every process of the run
pub(crate) fn make_world_accessible(path: &Path) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o777)) {
        tracing::warn!("Failed to chmod {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticHost;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Arc<ProcessContext> {
        let config = TraceConfig {
            output_dir: dir.path().to_path_buf(),
            ..TraceConfig::default()
        };
        ProcessContext::initialize(config, &SyntheticHost::new(4000, 1, "ctx")).unwrap()
    }

    #[test]
    fn test_initialize_creates_run_files() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        assert_eq!(ctx.trace_root(), dir.path().join("ctx-4000"));
        assert!(ctx.trace_root().join("insn.bytemap").exists());
        let tree = fs::read_to_string(ctx.trace_root().join("process_tree.txt")).unwrap();
        assert_eq!(tree, "1-4000\n");
        assert!(ctx.is_root_process());
        assert_eq!(ctx.process_dir(), ctx.trace_root().join("4000"));
    }

    #[test]
    fn test_lock_tracks_owner() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        {
            let _guard = ctx.lock(17);
            assert!(matches!(ctx.try_lock_for_signal(17), LockAttempt::HeldBySelf));
        }
        assert!(matches!(
            ctx.try_lock_for_signal(17),
            LockAttempt::Acquired(_)
        ));
    }

    #[test]
    fn test_signal_lock_gives_up_when_contended() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let _guard = ctx.lock(5);
        assert!(matches!(ctx.try_lock_for_signal(6), LockAttempt::Contended));
    }

    #[test]
    fn test_forked_child_context_is_fresh() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.lock(1).total_instructions = 99;
        let child = ctx.for_forked_child(4001).unwrap();
        assert_eq!(child.pid(), 4001);
        assert_eq!(child.root_pid(), 4000);
        assert!(!child.is_root_process());
        assert_eq!(child.trace_root(), ctx.trace_root());
        assert_eq!(child.total_instructions(), 0);
    }

    #[test]
    fn test_abort_is_process_wide_and_not_inherited() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        assert!(!ctx.is_aborted());
        assert!(ctx.abort());
        assert!(!ctx.abort());
        assert!(ctx.is_aborted());
        assert!(!ctx.for_forked_child(4002).unwrap().is_aborted());
    }

    #[test]
    fn test_finish_reports_total() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.lock(1).total_instructions = 42;
        assert_eq!(ctx.finish(), 42);
    }
}
