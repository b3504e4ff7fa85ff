//! Flush dispatcher: drain a stream buffer into its destination file
//!
//! A flush is a single synchronous write of the buffer's records, in order,
//! made while holding the process-wide lock. Per-thread streams go to the
//! owning session's files; the raw-byte map goes to the process-wide file.
//! A failed write is not retried: it is fatal for the tracing run.

use std::io::Write;

use crate::buffer::{BufferPool, TraceBuffer};
use crate::context::{ProcessContext, SharedState};
use crate::error::{Result, TraceError};
use crate::record::StreamKind;
use crate::session::TraceSession;

/// Flush `buffer` under the process-wide lock
///
/// Returns the number of records written. The caller resets the buffer.
pub fn flush(ctx: &ProcessContext, session: &mut TraceSession, buffer: &TraceBuffer) -> Result<usize> {
    let mut shared = ctx.lock(session.tid());
    write_locked(&mut shared, session, buffer)
}

/// Write `buffer` while the caller already holds the process-wide lock
pub(crate) fn write_locked(
    shared: &mut SharedState,
    session: &mut TraceSession,
    buffer: &TraceBuffer,
) -> Result<usize> {
    let bytes = buffer.contents();
    debug_assert_eq!(bytes.len() % buffer.record_size(), 0);
    let records = bytes.len() / buffer.record_size();
    if records == 0 {
        return Ok(0);
    }

    let kind = buffer.kind();
    let written = match session.file_mut(kind) {
        Some(file) => file.write_all(bytes),
        None => shared.bytemap.write_all(bytes),
    };
    written.map_err(|source| TraceError::FlushFailed {
        stream: kind,
        records,
        source,
    })?;

    if kind == StreamKind::Instruction {
        session.add_instructions(records as u64);
    }
    tracing::trace!("Flushed {} {} records", records, kind);
    Ok(records)
}

/// Explicit "flush now" of all five buffers
pub fn flush_all(ctx: &ProcessContext, session: &mut TraceSession, pool: &mut BufferPool) -> Result<()> {
    for kind in StreamKind::ALL {
        let buffer = pool.get_mut(kind);
        if buffer.is_empty() {
            continue;
        }
        flush(ctx, session, buffer)?;
        buffer.mark_flushed();
    }
    Ok(())
}

/// Flush all five buffers with the lock already held; returns records written
pub(crate) fn flush_all_locked(
    shared: &mut SharedState,
    session: &mut TraceSession,
    pool: &mut BufferPool,
) -> Result<usize> {
    let mut total = 0;
    for kind in StreamKind::ALL {
        let buffer = pool.get_mut(kind);
        if buffer.is_empty() {
            continue;
        }
        total += write_locked(shared, session, buffer)?;
        buffer.mark_flushed();
    }
    Ok(total)
}
