//! Peekaboo - instruction-level execution trace recorder
//!
//! This library records, for every traced thread, the stream of executed
//! instruction addresses together with a register snapshot and the memory
//! operands of each instruction. Records are buffered per thread and flushed
//! synchronously to fixed-size binary stream files, one directory per
//! process, with fork and fatal-signal handling.
//!
//! The instrumentation engine is abstracted behind
//! [`host::InstrumentationHost`]; [`synthetic`] provides a deterministic
//! implementation used by the `peekaboo synth` command and the tests.

pub mod arch;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod flush;
pub mod fork;
pub mod host;
pub mod reader;
pub mod record;
pub mod session;
pub mod signal;
pub mod synthetic;
pub mod tracer;

pub use error::{Result, TraceError};
