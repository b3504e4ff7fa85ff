//! Trace sessions: per-thread output files and directory lifecycle
//!
//! Sessions are thread-scoped. Every thread of process `<pid>` writes into
//! `<trace-root>/<pid>/`, and each of its stream files carries the thread id
//! as a suffix (`insn.trace.<tid>`, `regfile.<tid>`, ...), so threads never
//! share an output file and per-thread record correlation holds.

use chrono::Local;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::buffer::BufferPool;
use crate::context::ProcessContext;
use crate::error::{Result, TraceError};
use crate::flush;
use crate::host::InstrumentationHost;
use crate::record::{SessionMetadata, StreamKind};

/// Name of the per-session metadata file (before the thread suffix)
pub const METADATA_FILE: &str = "metafile";
/// Name of the per-process memory-map copy
pub const PROC_MAP_FILE: &str = "proc_map";

/// Open output files and counters of one thread's trace
#[derive(Debug)]
pub struct TraceSession {
    tid: u32,
    pid: u32,
    dir: PathBuf,
    /// Per-thread stream files, indexed like [`StreamKind::PER_THREAD`]
    files: [File; 4],
    metadata: File,
    num_refs: u64,
}

impl TraceSession {
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Instructions flushed to this session's instruction stream so far
    pub fn instruction_count(&self) -> u64 {
        self.num_refs
    }

    pub(crate) fn add_instructions(&mut self, count: u64) {
        self.num_refs += count;
    }

    /// Destination file of a per-thread stream; `None` for the shared byte map
    pub(crate) fn file_mut(&mut self, kind: StreamKind) -> Option<&mut File> {
        let index = StreamKind::PER_THREAD.iter().position(|k| *k == kind)?;
        Some(&mut self.files[index])
    }

    /// Ask the OS to persist every file of this session
    pub fn sync_all(&mut self) -> io::Result<()> {
        for file in self.files.iter_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        self.metadata.sync_all()
    }

    pub fn stream_path(&self, kind: StreamKind) -> PathBuf {
        stream_path(&self.dir, kind, self.tid)
    }

    pub fn metadata_path(&self) -> PathBuf {
        metadata_path(&self.dir, self.tid)
    }
}

/// Path of a per-thread stream file inside a process directory
pub fn stream_path(dir: &Path, kind: StreamKind, tid: u32) -> PathBuf {
    dir.join(format!("{}.{}", kind.file_name(), tid))
}

pub fn metadata_path(dir: &Path, tid: u32) -> PathBuf {
    dir.join(format!("{}.{}", METADATA_FILE, tid))
}

/// Create the trace root `<output_dir>/<binary>-<pid>`
///
/// If that name is taken, retry exactly once with a timestamp suffix;
/// a second failure is fatal for the run.
pub fn create_trace_root(output_dir: &Path, binary_name: &str, root_pid: u32) -> Result<PathBuf> {
    if let Err(e) = fs::create_dir_all(output_dir) {
        tracing::warn!("Unable to create output directory {}: {}", output_dir.display(), e);
    }

    let name = format!("{}-{}", binary_name, root_pid);
    let path = output_dir.join(&name);
    match fs::create_dir(&path) {
        Ok(()) => return Ok(path),
        Err(e) => tracing::debug!("Trace root {} unavailable: {}", path.display(), e),
    }

    let now = Local::now();
    let stamped = format!(
        "{}-{}-{}",
        name,
        now.format("%Y_%m_%d-%H_%M_%S"),
        now.timestamp_subsec_nanos() % 1_000_000
    );
    let path = output_dir.join(stamped);
    fs::create_dir(&path).map_err(|source| TraceError::TraceRootCreation {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Open a session for thread `tid` of the context's process
///
/// Creates the process directory if needed, the four stream files and the
/// metadata file, and writes the metadata header. The first session of a
/// process also copies the memory map.
pub fn open_session<H: InstrumentationHost>(
    ctx: &ProcessContext,
    tid: u32,
    host: &H,
) -> Result<TraceSession> {
    let mut shared = ctx.lock(tid);
    let dir = ctx.process_dir();

    if shared.live_threads.contains(&tid) {
        return Err(TraceError::SessionCreation {
            path: dir,
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("thread {} already has a live session", tid),
            ),
        });
    }

    fs::create_dir_all(&dir).map_err(|source| TraceError::SessionCreation {
        path: dir.clone(),
        source,
    })?;

    let create = |path: PathBuf| {
        File::create(&path).map_err(|source| TraceError::SessionCreation { path, source })
    };
    let files = [
        create(stream_path(&dir, StreamKind::Instruction, tid))?,
        create(stream_path(&dir, StreamKind::Register, tid))?,
        create(stream_path(&dir, StreamKind::MemoryCount, tid))?,
        create(stream_path(&dir, StreamKind::MemoryDetail, tid))?,
    ];
    let meta_path = metadata_path(&dir, tid);
    let mut metadata = create(meta_path.clone())?;
    SessionMetadata::new(ctx.layout().arch)
        .write(&mut metadata)
        .map_err(|source| TraceError::SessionCreation {
            path: meta_path,
            source,
        })?;

    if shared.sessions_opened == 0 && ctx.config().copy_memory_map {
        let proc_map = dir.join(PROC_MAP_FILE);
        if !proc_map.exists() {
            if let Err(e) = host.copy_memory_map(&proc_map) {
                tracing::warn!("Unable to copy memory map to {}: {}", proc_map.display(), e);
            }
        }
    }

    shared.sessions_opened += 1;
    shared.live_threads.insert(tid);
    tracing::info!("Created a new trace for {} (thread {})", ctx.pid(), tid);

    Ok(TraceSession {
        tid,
        pid: ctx.pid(),
        dir,
        files,
        metadata,
        num_refs: 0,
    })
}

/// Flush every buffer one last time, close the files and fold the
/// session's instruction count into the process total
///
/// Returns the session's instruction count. Pass `flush_pending = false`
/// when tracing was aborted and the buffers must not be written.
pub fn close_session(
    ctx: &ProcessContext,
    mut session: TraceSession,
    pool: &mut BufferPool,
    flush_pending: bool,
) -> Result<u64> {
    let flushed = if flush_pending {
        flush::flush_all(ctx, &mut session, pool)
    } else {
        Ok(())
    };

    let count = session.instruction_count();
    let tid = session.tid();
    for kind in StreamKind::ALL {
        let stats = pool.get(kind).stats();
        tracing::debug!(
            "Thread {} {} stream: {} records in {} flushes, {} of {} slots unflushed",
            tid,
            kind,
            stats.total_appended,
            stats.total_flushes,
            stats.current_size,
            stats.capacity
        );
    }
    {
        let mut shared = ctx.lock(tid);
        shared.total_instructions += count;
        shared.live_threads.remove(&tid);
    }
    drop(session);
    tracing::debug!("Closed trace session for thread {} ({} instructions)", tid, count);

    flushed.map(|_| count)
}
