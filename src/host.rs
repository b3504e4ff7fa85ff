//! Capability interface between the recorder and the instrumentation engine
//!
//! The engine decides where capture happens and owns the execution context.
//! It hands the recorder one [`InstructionEvent`] per executed instruction,
//! one block of [`BlockInstruction`]s per basic-block compilation, and answers
//! register-file and process-identity queries through [`InstrumentationHost`].

use std::fs;
use std::io;
use std::path::Path;

use crate::arch::{Arch, RegisterLayout, RegisterSnapshot};
use crate::record::AccessDirection;

/// One memory operand of an instruction about to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub address: u64,
    pub size: u32,
    pub direction: AccessDirection,
}

impl MemoryOperand {
    pub fn read(address: u64, size: u32) -> Self {
        Self {
            address,
            size,
            direction: AccessDirection::Read,
        }
    }

    pub fn write(address: u64, size: u32) -> Self {
        Self {
            address,
            size,
            direction: AccessDirection::Write,
        }
    }
}

/// Per-instruction capture callback payload
///
/// Operands are listed sources first, then destinations.
#[derive(Debug, Clone, Copy)]
pub struct InstructionEvent<'a> {
    pub address: u64,
    pub length: u32,
    pub raw_bytes: &'a [u8],
    pub operands: &'a [MemoryOperand],
}

impl InstructionEvent<'_> {
    /// Address of the instruction that follows this one in memory
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(u64::from(self.length))
    }
}

/// One instruction of a basic block being compiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInstruction {
    pub address: u64,
    pub raw_bytes: Vec<u8>,
}

/// Services the recorder needs from the instrumentation engine
pub trait InstrumentationHost {
    fn process_id(&self) -> u32;

    fn parent_process_id(&self) -> u32;

    /// Name of the traced binary, used to name the trace root
    fn application_name(&self) -> String;

    /// Architecture of the traced program
    fn arch(&self) -> Arch {
        Arch::detect()
    }

    /// Snapshot the current thread's register file in `layout`
    fn capture_registers(&mut self, layout: &RegisterLayout) -> RegisterSnapshot;

    /// Copy the process memory-map description to `dest`
    fn copy_memory_map(&self, dest: &Path) -> io::Result<()> {
        fs::copy(format!("/proc/{}/maps", self.process_id()), dest).map(drop)
    }
}
