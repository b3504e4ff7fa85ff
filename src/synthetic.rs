//! Synthetic instruction streams
//!
//! A deterministic stand-in for the instrumentation engine: [`SyntheticHost`]
//! answers register and process queries, [`SyntheticProgram`] produces a loop
//! of fixed-length instructions with a configurable number of memory operands
//! and feeds them to a [`ThreadTracer`] the way an engine would, compiling
//! each basic block once.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::Path;

use crate::arch::{Arch, RegisterLayout, RegisterSnapshot};
use crate::error::Result;
use crate::host::{BlockInstruction, InstructionEvent, InstrumentationHost, MemoryOperand};
use crate::tracer::ThreadTracer;

/// Encoded length of every synthetic instruction
pub const SYNTHETIC_INSN_LEN: u32 = 4;

const STACK_TOP: u64 = 0x7ffd_0000_0000;
const STACK_TOP_32: u32 = 0xbfff_f000;
const DATA_BASE: u64 = 0x6000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessIds {
    Fixed { pid: u32, ppid: u32 },
    /// Ask the OS on every query, so ids follow real forks
    Native,
}

/// Host capability backed by counters instead of a real register file
#[derive(Debug, Clone)]
pub struct SyntheticHost {
    ids: ProcessIds,
    name: String,
    arch: Arch,
    captured: u64,
}

impl SyntheticHost {
    /// Host with fixed process ids, reporting AMD64
    pub fn new(pid: u32, ppid: u32, name: &str) -> Self {
        Self {
            ids: ProcessIds::Fixed { pid, ppid },
            name: name.to_string(),
            arch: Arch::Amd64,
            captured: 0,
        }
    }

    /// Host reporting the calling process's real ids and architecture
    pub fn native(name: &str) -> Self {
        Self {
            ids: ProcessIds::Native,
            name: name.to_string(),
            arch: Arch::detect(),
            captured: 0,
        }
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    /// Pretend to be a different process (e.g. the child after a fork)
    pub fn set_process_ids(&mut self, pid: u32, ppid: u32) {
        self.ids = ProcessIds::Fixed { pid, ppid };
    }

    /// Register snapshots handed out so far
    pub fn captured(&self) -> u64 {
        self.captured
    }
}

impl InstrumentationHost for SyntheticHost {
    fn process_id(&self) -> u32 {
        match self.ids {
            ProcessIds::Fixed { pid, .. } => pid,
            ProcessIds::Native => nix::unistd::getpid().as_raw() as u32,
        }
    }

    fn parent_process_id(&self) -> u32 {
        match self.ids {
            ProcessIds::Fixed { ppid, .. } => ppid,
            ProcessIds::Native => nix::unistd::getppid().as_raw() as u32,
        }
    }

    fn application_name(&self) -> String {
        self.name.clone()
    }

    fn arch(&self) -> Arch {
        self.arch
    }

    fn capture_registers(&mut self, layout: &RegisterLayout) -> RegisterSnapshot {
        let n = self.captured;
        self.captured += 1;

        let mut snapshot = layout.empty_snapshot();
        match &mut snapshot {
            RegisterSnapshot::Amd64(regs) => {
                regs.gpr.rax = n;
                regs.gpr.rsp = STACK_TOP - (n % 512) * 8;
                regs.gpr.rflags = 0x246;
            }
            RegisterSnapshot::X86(regs) => {
                regs.eax = n as u32;
                regs.esp = STACK_TOP_32 - (n as u32 % 512) * 4;
            }
            RegisterSnapshot::AArch64(regs) => {
                regs.x[0] = n;
                regs.sp = STACK_TOP - (n % 512) * 16;
            }
        }
        snapshot
    }

    fn copy_memory_map(&self, dest: &Path) -> io::Result<()> {
        match self.ids {
            ProcessIds::Native => fs::copy("/proc/self/maps", dest).map(drop),
            ProcessIds::Fixed { .. } => fs::write(
                dest,
                format!(
                    "00400000-00401000 r-xp 00000000 00:00 0 /synthetic/{}\n",
                    self.name
                ),
            ),
        }
    }
}

/// A loop of `blocks` basic blocks of `block_len` instructions each
#[derive(Debug, Clone)]
pub struct SyntheticProgram {
    pub base: u64,
    pub block_len: usize,
    pub blocks: usize,
    /// Instruction `n` has `n % (mem_ops + 1)` memory operands
    pub mem_ops: usize,
    compiled: HashSet<usize>,
}

impl SyntheticProgram {
    pub fn new(mem_ops: usize) -> Self {
        Self {
            base: 0x40_0000,
            block_len: 8,
            blocks: 16,
            mem_ops,
            compiled: HashSet::new(),
        }
    }

    fn slots(&self) -> u64 {
        (self.block_len * self.blocks) as u64
    }

    /// Address of the `n`th executed instruction
    pub fn address(&self, n: u64) -> u64 {
        self.base + (n % self.slots()) * u64::from(SYNTHETIC_INSN_LEN)
    }

    pub fn encoding(address: u64) -> [u8; SYNTHETIC_INSN_LEN as usize] {
        [0x48, 0x89, (address >> 2) as u8, 0xc3]
    }

    /// Number of memory operands of the `n`th executed instruction
    pub fn operand_count(&self, n: u64) -> usize {
        (n % (self.mem_ops as u64 + 1)) as usize
    }

    /// Memory operands of the `n`th executed instruction, reads first
    pub fn operands(&self, n: u64) -> Vec<MemoryOperand> {
        let count = self.operand_count(n);
        let reads = count.div_ceil(2);
        (0..count)
            .map(|i| {
                let address = DATA_BASE + (n % 4096) * 64 + i as u64 * 8;
                if i < reads {
                    MemoryOperand::read(address, 8)
                } else {
                    MemoryOperand::write(address, 8)
                }
            })
            .collect()
    }

    /// Instructions of basic block `index`
    pub fn block(&self, index: usize) -> Vec<BlockInstruction> {
        (0..self.block_len)
            .map(|i| {
                let address = self.address((index * self.block_len + i) as u64);
                BlockInstruction {
                    address,
                    raw_bytes: Self::encoding(address).to_vec(),
                }
            })
            .collect()
    }

    /// Execute instructions `range` of the loop under `tracer`
    pub fn drive<H: InstrumentationHost>(
        &mut self,
        tracer: &mut ThreadTracer<H>,
        range: Range<u64>,
    ) -> Result<()> {
        for n in range {
            let slot = (n % self.slots()) as usize;
            let block = slot / self.block_len;
            if slot % self.block_len == 0 && self.compiled.insert(block) {
                tracer.on_block(&self.block(block))?;
            }

            let address = self.address(n);
            let bytes = Self::encoding(address);
            let operands = self.operands(n);
            tracer.on_instruction(&InstructionEvent {
                address,
                length: SYNTHETIC_INSN_LEN,
                raw_bytes: &bytes,
                operands: &operands,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_counts_cycle() {
        let program = SyntheticProgram::new(2);
        let counts: Vec<_> = (0..6).map(|n| program.operand_count(n)).collect();
        assert_eq!(counts, vec![0, 1, 2, 0, 1, 2]);
        let ops = program.operands(2);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].direction, crate::record::AccessDirection::Read);
        assert_eq!(ops[1].direction, crate::record::AccessDirection::Write);
    }

    #[test]
    fn test_no_operands_without_mem_ops() {
        let program = SyntheticProgram::new(0);
        assert!((0..100).all(|n| program.operands(n).is_empty()));
    }

    #[test]
    fn test_addresses_loop() {
        let program = SyntheticProgram::new(0);
        assert_eq!(program.address(0), 0x40_0000);
        assert_eq!(program.address(1), 0x40_0004);
        assert_eq!(program.address(128), 0x40_0000);
        assert_eq!(program.block(1)[0].address, 0x40_0020);
    }

    #[test]
    fn test_capture_counts_snapshots() {
        let mut host = SyntheticHost::new(1, 0, "s");
        let layout = RegisterLayout::new(Arch::Amd64, false, false).unwrap();
        let first = host.capture_registers(&layout);
        let second = host.capture_registers(&layout);
        assert_ne!(first, second);
        assert_eq!(host.captured(), 2);
    }
}
