//! Reading recorded traces back
//!
//! [`TraceReader`] walks a trace root, decodes every stream of every thread
//! session and checks the properties a well-formed trace must have:
//!
//! - every stream file is a whole number of records long
//! - instruction, memory-count and register streams have equal lengths
//! - the memory-detail stream holds exactly the sum of the memory counts
//! - each memory detail names the instruction it belongs to
//!
//! The register layout of a session is not stored on disk. It is inferred
//! from the metadata architecture and the register file size, or given
//! explicitly with [`TraceReader::with_layout`].

use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::arch::{Arch, RegisterLayout, RegisterSnapshot};
use crate::error::{Result, TraceError};
use crate::fork::ProcessTreeLog;
use crate::record::{
    DecodeRecord, InstructionRef, InstructionRef32, MemoryAccessDetail, MemoryReferenceCount,
    ProcessTreeEntry, RawByteMapEntry, SessionMetadata, StreamKind, FORMAT_VERSION,
};
use crate::session::{metadata_path, stream_path, METADATA_FILE};

/// A recorded trace root
#[derive(Debug, Clone)]
pub struct TraceReader {
    root: PathBuf,
    layout: Option<RegisterLayout>,
}

/// Every decoded stream of one thread session
#[derive(Debug, Clone)]
pub struct ThreadTrace {
    pub pid: u32,
    pub tid: u32,
    pub metadata: SessionMetadata,
    pub layout: RegisterLayout,
    pub instructions: Vec<InstructionRef>,
    pub memory_counts: Vec<MemoryReferenceCount>,
    pub memory_details: Vec<MemoryAccessDetail>,
    pub registers: Vec<RegisterSnapshot>,
}

/// A property a recorded trace fails to satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A stream's record count differs from the instruction stream's
    CountMismatch {
        pid: u32,
        tid: u32,
        stream: StreamKind,
        expected: usize,
        actual: usize,
    },
    /// Memory counts add up past `u64::MAX` at `instruction`
    CountOverflow {
        pid: u32,
        tid: u32,
        instruction: usize,
    },
    /// Memory-detail records do not add up to the stored counts
    DetailTotal {
        pid: u32,
        tid: u32,
        expected: u64,
        actual: usize,
    },
    /// A memory detail claims a different owning instruction
    DetailOwner {
        pid: u32,
        tid: u32,
        instruction: usize,
        expected_pc: u64,
        actual_pc: u64,
    },
    UnsupportedVersion { pid: u32, tid: u32, version: u32 },
    /// A process directory without a process-tree entry
    MissingTreeEntry { pid: u32 },
    Corrupt { path: PathBuf, reason: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountMismatch {
                pid,
                tid,
                stream,
                expected,
                actual,
            } => write!(
                f,
                "{}/{}: {} stream has {} records, expected {}",
                pid, tid, stream, actual, expected
            ),
            Self::CountOverflow {
                pid,
                tid,
                instruction,
            } => write!(
                f,
                "{}/{}: memory counts overflow at instruction {}",
                pid, tid, instruction
            ),
            Self::DetailTotal {
                pid,
                tid,
                expected,
                actual,
            } => write!(
                f,
                "{}/{}: {} memory details recorded, counts add up to {}",
                pid, tid, actual, expected
            ),
            Self::DetailOwner {
                pid,
                tid,
                instruction,
                expected_pc,
                actual_pc,
            } => write!(
                f,
                "{}/{}: instruction {} at {:#x} owns a detail tagged {:#x}",
                pid, tid, instruction, expected_pc, actual_pc
            ),
            Self::UnsupportedVersion { pid, tid, version } => write!(
                f,
                "{}/{}: format version {} (expected {})",
                pid, tid, version, FORMAT_VERSION
            ),
            Self::MissingTreeEntry { pid } => {
                write!(f, "process {} is missing from the process tree", pid)
            }
            Self::Corrupt { path, reason } => write!(f, "{}: {}", path.display(), reason),
        }
    }
}

/// Overview of a trace root, as printed by `peekaboo inspect`
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub root: PathBuf,
    pub process_tree: Vec<ProcessTreeEntry>,
    pub byte_map_entries: usize,
    pub processes: Vec<ProcessSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub threads: Vec<ThreadSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub tid: u32,
    pub arch: Arch,
    pub version: u32,
    pub instructions: usize,
    pub memory_details: usize,
    pub register_record_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_pc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pc: Option<u64>,
}

impl TraceSummary {
    pub fn total_instructions(&self) -> usize {
        self.processes
            .iter()
            .flat_map(|p| p.threads.iter())
            .map(|t| t.instructions)
            .sum()
    }
}

impl TraceReader {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(TraceError::CorruptTrace {
                path: root,
                reason: "not a trace root directory".to_string(),
            });
        }
        Ok(Self { root, layout: None })
    }

    /// Decode register streams with a known layout instead of inferring it
    pub fn with_layout(mut self, layout: RegisterLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pids with a process directory, ascending
    pub fn processes(&self) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    /// Thread ids with a session in process `pid`, ascending
    pub fn threads(&self, pid: u32) -> Result<Vec<u32>> {
        let prefix = format!("{}.", METADATA_FILE);
        let mut tids = Vec::new();
        for entry in fs::read_dir(self.root.join(pid.to_string()))? {
            let name = entry?.file_name();
            if let Some(tid) = name
                .to_str()
                .and_then(|s| s.strip_prefix(&prefix))
                .and_then(|s| s.parse().ok())
            {
                tids.push(tid);
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }

    pub fn process_tree(&self) -> Result<Vec<ProcessTreeEntry>> {
        ProcessTreeLog::at(&self.root).entries()
    }

    pub fn byte_map(&self) -> Result<Vec<RawByteMapEntry>> {
        read_stream(&self.root.join(StreamKind::RawByteMap.file_name()))
    }

    /// Decode every stream of one thread session
    pub fn thread(&self, pid: u32, tid: u32) -> Result<ThreadTrace> {
        let dir = self.root.join(pid.to_string());
        let meta_path = metadata_path(&dir, tid);
        let metadata =
            SessionMetadata::decode(&read_file(&meta_path)?).ok_or_else(|| {
                TraceError::CorruptTrace {
                    path: meta_path.clone(),
                    reason: "missing or unknown metadata header".to_string(),
                }
            })?;

        let instructions = read_instructions(
            &stream_path(&dir, StreamKind::Instruction, tid),
            metadata.arch,
        )?;
        let memory_counts = read_stream(&stream_path(&dir, StreamKind::MemoryCount, tid))?;
        let memory_details = read_stream(&stream_path(&dir, StreamKind::MemoryDetail, tid))?;

        let reg_path = stream_path(&dir, StreamKind::Register, tid);
        let reg_bytes = read_file(&reg_path)?;
        let layout = self.register_layout(metadata.arch, reg_bytes.len(), instructions.len(), &reg_path)?;
        let registers = decode_registers(&reg_path, &reg_bytes, &layout)?;

        Ok(ThreadTrace {
            pid,
            tid,
            metadata,
            layout,
            instructions,
            memory_counts,
            memory_details,
            registers,
        })
    }

    fn register_layout(
        &self,
        arch: Arch,
        file_len: usize,
        records: usize,
        path: &Path,
    ) -> Result<RegisterLayout> {
        if let Some(layout) = self.layout.filter(|l| l.arch == arch) {
            return Ok(layout);
        }
        let plain = RegisterLayout::new(arch, false, false).map_err(|e| TraceError::CorruptTrace {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if arch != Arch::Amd64 || records == 0 || file_len % records != 0 {
            return Ok(plain);
        }
        // simd-only and fxsave-only have the same size; simd wins
        let size = file_len / records;
        [(false, false), (true, false), (false, true), (true, true)]
            .into_iter()
            .filter_map(|(simd, fxsave)| RegisterLayout::new(arch, simd, fxsave).ok())
            .find(|layout| layout.record_size() == size)
            .ok_or_else(|| TraceError::CorruptTrace {
                path: path.to_path_buf(),
                reason: format!("{}-byte register records match no {} layout", size, arch),
            })
    }

    /// Check every session, the byte map and the process tree
    ///
    /// Corrupt files are reported as violations; only I/O errors on the
    /// trace root itself are returned as errors.
    pub fn verify(&self) -> Result<Vec<Violation>> {
        let mut violations = Vec::new();

        let tree_log = ProcessTreeLog::at(&self.root);
        let tree = match tree_log.entries() {
            Ok(tree) => tree,
            Err(e) => {
                violations.push(corrupt(e, tree_log.path().to_path_buf())?);
                Vec::new()
            }
        };
        if let Err(e) = self.byte_map() {
            violations.push(corrupt(e, self.root.join(StreamKind::RawByteMap.file_name()))?);
        }

        for pid in self.processes()? {
            if !tree.iter().any(|entry| entry.child == pid) {
                violations.push(Violation::MissingTreeEntry { pid });
            }
            for tid in self.threads(pid)? {
                match self.thread(pid, tid) {
                    Ok(trace) => violations.extend(trace.check()),
                    Err(e) => violations.push(corrupt(e, self.root.join(pid.to_string()))?),
                }
            }
        }
        Ok(violations)
    }

    pub fn summary(&self) -> Result<TraceSummary> {
        let mut processes = Vec::new();
        for pid in self.processes()? {
            let mut threads = Vec::new();
            for tid in self.threads(pid)? {
                let trace = self.thread(pid, tid)?;
                threads.push(ThreadSummary {
                    tid,
                    arch: trace.metadata.arch,
                    version: trace.metadata.version,
                    instructions: trace.instructions.len(),
                    memory_details: trace.memory_details.len(),
                    register_record_size: trace.layout.record_size(),
                    first_pc: trace.instructions.first().map(|i| i.pc),
                    last_pc: trace.instructions.last().map(|i| i.pc),
                });
            }
            processes.push(ProcessSummary { pid, threads });
        }
        Ok(TraceSummary {
            root: self.root.clone(),
            process_tree: self.process_tree()?,
            byte_map_entries: self.byte_map()?.len(),
            processes,
        })
    }
}

impl ThreadTrace {
    /// Correlation checks across the streams of this session
    pub fn check(&self) -> Vec<Violation> {
        let (pid, tid) = (self.pid, self.tid);
        let mut violations = Vec::new();

        if self.metadata.version != FORMAT_VERSION {
            violations.push(Violation::UnsupportedVersion {
                pid,
                tid,
                version: self.metadata.version,
            });
        }

        let expected = self.instructions.len();
        for (stream, actual) in [
            (StreamKind::MemoryCount, self.memory_counts.len()),
            (StreamKind::Register, self.registers.len()),
        ] {
            if actual != expected {
                violations.push(Violation::CountMismatch {
                    pid,
                    tid,
                    stream,
                    expected,
                    actual,
                });
            }
        }

        let mut total = 0u64;
        for (instruction, count) in self.memory_counts.iter().enumerate() {
            match total.checked_add(count.length) {
                Some(sum) => total = sum,
                None => {
                    violations.push(Violation::CountOverflow {
                        pid,
                        tid,
                        instruction,
                    });
                    return violations;
                }
            }
        }
        if total != self.memory_details.len() as u64 {
            violations.push(Violation::DetailTotal {
                pid,
                tid,
                expected: total,
                actual: self.memory_details.len(),
            });
            return violations;
        }

        let mut details = self.memory_details.iter();
        for (index, (insn, count)) in self.instructions.iter().zip(&self.memory_counts).enumerate() {
            for detail in details.by_ref().take(count.length as usize) {
                if detail.pc != insn.pc {
                    violations.push(Violation::DetailOwner {
                        pid,
                        tid,
                        instruction: index,
                        expected_pc: insn.pc,
                        actual_pc: detail.pc,
                    });
                }
            }
        }
        violations
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => TraceError::CorruptTrace {
            path: path.to_path_buf(),
            reason: "file is missing".to_string(),
        },
        _ => TraceError::Io(e),
    })
}

/// Decode an instruction stream of pointer-width records for `arch`
fn read_instructions(path: &Path, arch: Arch) -> Result<Vec<InstructionRef>> {
    if InstructionRef::record_size(arch) == InstructionRef32::SIZE {
        let narrow: Vec<InstructionRef32> = read_stream(path)?;
        Ok(narrow.into_iter().map(InstructionRef::from).collect())
    } else {
        read_stream(path)
    }
}

/// Decode a stream file of fixed-size records, rejecting partial records
pub fn read_stream<R: DecodeRecord>(path: &Path) -> Result<Vec<R>> {
    let bytes = read_file(path)?;
    if bytes.len() % R::SIZE != 0 {
        return Err(TraceError::CorruptTrace {
            path: path.to_path_buf(),
            reason: format!(
                "{} bytes is not a whole number of {}-byte records",
                bytes.len(),
                R::SIZE
            ),
        });
    }
    bytes
        .chunks_exact(R::SIZE)
        .enumerate()
        .map(|(index, chunk)| {
            R::decode(chunk).ok_or_else(|| TraceError::CorruptTrace {
                path: path.to_path_buf(),
                reason: format!("undecodable record {}", index),
            })
        })
        .collect()
}

fn decode_registers(path: &Path, bytes: &[u8], layout: &RegisterLayout) -> Result<Vec<RegisterSnapshot>> {
    let size = layout.record_size();
    if size == 0 || bytes.len() % size != 0 {
        return Err(TraceError::CorruptTrace {
            path: path.to_path_buf(),
            reason: format!(
                "{} bytes is not a whole number of {}-byte register records",
                bytes.len(),
                size
            ),
        });
    }
    bytes
        .chunks_exact(size)
        .enumerate()
        .map(|(index, chunk)| {
            RegisterSnapshot::decode(layout, chunk).ok_or_else(|| TraceError::CorruptTrace {
                path: path.to_path_buf(),
                reason: format!("undecodable register record {}", index),
            })
        })
        .collect()
}

fn corrupt(err: TraceError, fallback: PathBuf) -> Result<Violation> {
    match err {
        TraceError::CorruptTrace { path, reason } => Ok(Violation::Corrupt { path, reason }),
        TraceError::Io(e) if e.kind() == io::ErrorKind::NotFound => Ok(Violation::Corrupt {
            path: fallback,
            reason: "file is missing".to_string(),
        }),
        other => Err(other),
    }
}
