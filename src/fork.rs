//! Fork coordination and the process-tree log
//!
//! A forked child starts with copies of the parent's buffers and file
//! handles. None of them may be written: the child discards every buffer,
//! builds a fresh [`ProcessContext`], records the fork in the run-wide
//! process-tree log and opens a brand-new session under its own pid.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::context::{make_world_accessible, ProcessContext};
use crate::error::{Result, TraceError};
use crate::host::InstrumentationHost;
use crate::record::ProcessTreeEntry;
use crate::session::{self, TraceSession};

/// Append-only `parent-child` pid log shared by every process of a run
#[derive(Debug, Clone)]
pub struct ProcessTreeLog {
    path: PathBuf,
}

impl ProcessTreeLog {
    pub const FILE_NAME: &'static str = "process_tree.txt";

    pub fn at(trace_root: &Path) -> Self {
        Self {
            path: trace_root.join(Self::FILE_NAME),
        }
    }

    /// Start a new log holding the root process's entry
    pub fn create(trace_root: &Path, root: ProcessTreeEntry) -> Result<Self> {
        let log = Self::at(trace_root);
        let mut file = File::create(&log.path).map_err(|source| TraceError::ProcessTree {
            path: log.path.clone(),
            source,
        })?;
        writeln!(file, "{}", root).map_err(|source| TraceError::ProcessTree {
            path: log.path.clone(),
            source,
        })?;
        make_world_accessible(&log.path);
        Ok(log)
    }

    /// Append one entry as a single write
    pub fn append(&self, entry: ProcessTreeEntry) -> Result<()> {
        let line = format!("{}\n", entry);
        File::options()
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|source| TraceError::ProcessTree {
                path: self.path.clone(),
                source,
            })
    }

    pub fn entries(&self) -> Result<Vec<ProcessTreeEntry>> {
        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.parse().map_err(|reason| TraceError::CorruptTrace {
                    path: self.path.clone(),
                    reason,
                })
            })
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Everything a thread tracer needs to continue inside a forked child
pub struct ForkedState {
    pub ctx: Arc<ProcessContext>,
    pub pool: BufferPool,
    pub session: TraceSession,
}

/// Rebuild tracing state in a freshly forked child
///
/// Must run in the child on the forking thread. The inherited buffers are
/// dropped unflushed by the caller once this returns.
pub fn rebuild_in_child<H: InstrumentationHost>(
    parent_ctx: &ProcessContext,
    tid: u32,
    host: &H,
) -> Result<ForkedState> {
    let child_pid = host.process_id();
    let entry = ProcessTreeEntry {
        parent: host.parent_process_id(),
        child: child_pid,
    };

    let ctx = parent_ctx.for_forked_child(child_pid)?;
    {
        let _shared = ctx.lock(tid);
        ProcessTreeLog::at(ctx.trace_root()).append(entry)?;
    }
    tracing::info!("Application process forks: {}", entry);

    let pool = BufferPool::new(&ctx.config().capacities, ctx.layout());
    let session = session::open_session(&ctx, tid, host)?;
    Ok(ForkedState { ctx, pool, session })
}
