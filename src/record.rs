//! Fixed binary record layouts for the five trace streams
//!
//! Every stream holds homogeneous fixed-size records, so a stream file is
//! always a whole number of records long and the Nth record of one stream can
//! be matched against the Nth record of another. All fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::arch::Arch;
use crate::error::{Result, TraceError};

/// On-disk format version written into every session's metadata
pub const FORMAT_VERSION: u32 = 2;

/// Longest instruction encoding on the supported architectures
pub const MAX_INSN_BYTES: usize = 16;

/// The five record streams of a thread's trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Instruction,
    Register,
    MemoryCount,
    MemoryDetail,
    RawByteMap,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Instruction,
        StreamKind::Register,
        StreamKind::MemoryCount,
        StreamKind::MemoryDetail,
        StreamKind::RawByteMap,
    ];

    /// Streams written to per-thread files (the raw-byte map is process-wide)
    pub const PER_THREAD: [StreamKind; 4] = [
        StreamKind::Instruction,
        StreamKind::Register,
        StreamKind::MemoryCount,
        StreamKind::MemoryDetail,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Base file name of this stream
    pub fn file_name(self) -> &'static str {
        match self {
            StreamKind::Instruction => "insn.trace",
            StreamKind::Register => "regfile",
            StreamKind::MemoryCount => "memrefs",
            StreamKind::MemoryDetail => "memfile",
            StreamKind::RawByteMap => "insn.bytemap",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Instruction => "instruction",
            StreamKind::Register => "register",
            StreamKind::MemoryCount => "memory-count",
            StreamKind::MemoryDetail => "memory-detail",
            StreamKind::RawByteMap => "raw-byte-map",
        };
        write!(f, "{}", name)
    }
}

/// A record with a fixed encoded size that belongs to one stream
pub trait FixedRecord {
    const STREAM: StreamKind;

    /// Encoded size of this record in bytes
    fn encoded_len(&self) -> usize;

    /// Encode into `out`, which is exactly `encoded_len()` bytes long
    fn write_to(&self, out: &mut [u8]);
}

/// A record whose size does not depend on runtime configuration
pub trait DecodeRecord: Sized {
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Option<Self>;
}

/// Sequential little-endian field writer over a record slot
pub(crate) struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn u64(&mut self, value: u64) {
        LittleEndian::write_u64(&mut self.buf[self.pos..self.pos + 8], value);
        self.pos += 8;
    }

    pub(crate) fn u32(&mut self, value: u32) {
        LittleEndian::write_u32(&mut self.buf[self.pos..self.pos + 4], value);
        self.pos += 4;
    }

    pub(crate) fn bytes(&mut self, value: &[u8]) {
        self.buf[self.pos..self.pos + value.len()].copy_from_slice(value);
        self.pos += value.len();
    }
}

/// Sequential little-endian field reader; callers check the length up front
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn u64(&mut self) -> u64 {
        let value = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        value
    }

    pub(crate) fn u32(&mut self) -> u32 {
        let value = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        value
    }

    pub(crate) fn bytes(&mut self, len: usize) -> &'a [u8] {
        let value = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        value
    }
}

/// Address of one executed instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct InstructionRef {
    pub pc: u64,
}

impl FixedRecord for InstructionRef {
    const STREAM: StreamKind = StreamKind::Instruction;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write_to(&self, out: &mut [u8]) {
        FieldWriter::new(out).u64(self.pc);
    }
}

impl DecodeRecord for InstructionRef {
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == Self::SIZE).then(|| Self {
            pc: FieldReader::new(bytes).u64(),
        })
    }
}

impl InstructionRef {
    /// Encoded size of an instruction record on `arch`: one pointer-width address
    pub fn record_size(arch: Arch) -> usize {
        arch.pointer_width()
    }
}

/// Address of one executed instruction on a 32-bit architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionRef32 {
    pub pc: u32,
}

impl FixedRecord for InstructionRef32 {
    const STREAM: StreamKind = StreamKind::Instruction;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write_to(&self, out: &mut [u8]) {
        FieldWriter::new(out).u32(self.pc);
    }
}

impl DecodeRecord for InstructionRef32 {
    const SIZE: usize = 4;

    fn decode(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == Self::SIZE).then(|| Self {
            pc: FieldReader::new(bytes).u32(),
        })
    }
}

impl From<InstructionRef32> for InstructionRef {
    fn from(insn: InstructionRef32) -> Self {
        Self {
            pc: u64::from(insn.pc),
        }
    }
}

/// Number of memory operands of one executed instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct MemoryReferenceCount {
    pub length: u64,
}

impl FixedRecord for MemoryReferenceCount {
    const STREAM: StreamKind = StreamKind::MemoryCount;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write_to(&self, out: &mut [u8]) {
        FieldWriter::new(out).u64(self.length);
    }
}

impl DecodeRecord for MemoryReferenceCount {
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == Self::SIZE).then(|| Self {
            length: FieldReader::new(bytes).u64(),
        })
    }
}

/// Direction of a memory operand
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum AccessDirection {
    Read = 0,
    Write = 1,
}

/// One memory operand of one executed instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct MemoryAccessDetail {
    pub addr: u64,
    /// Value placeholder; the capture path stores zero
    pub value: u64,
    pub size: u32,
    pub direction: AccessDirection,
    /// Address of the instruction owning this operand
    pub pc: u64,
}

impl FixedRecord for MemoryAccessDetail {
    const STREAM: StreamKind = StreamKind::MemoryDetail;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write_to(&self, out: &mut [u8]) {
        let mut w = FieldWriter::new(out);
        w.u64(self.addr);
        w.u64(self.value);
        w.u32(self.size);
        w.u32(self.direction as u32);
        w.u64(self.pc);
    }
}

impl DecodeRecord for MemoryAccessDetail {
    const SIZE: usize = 32;

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut r = FieldReader::new(bytes);
        let addr = r.u64();
        let value = r.u64();
        let size = r.u32();
        let direction = match r.u32() {
            0 => AccessDirection::Read,
            1 => AccessDirection::Write,
            _ => return None,
        };
        Some(Self {
            addr,
            value,
            size,
            direction,
            pc: r.u64(),
        })
    }
}

/// Address, length and encoding of one instruction in a compiled block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawByteMapEntry {
    pub pc: u64,
    pub size: u32,
    pub rawbytes: [u8; MAX_INSN_BYTES],
}

impl RawByteMapEntry {
    /// Build an entry, rejecting encodings longer than [`MAX_INSN_BYTES`]
    pub fn new(pc: u64, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_INSN_BYTES {
            return Err(TraceError::MalformedRecord {
                stream: StreamKind::RawByteMap,
                expected: MAX_INSN_BYTES,
                actual: bytes.len(),
            });
        }
        let mut rawbytes = [0u8; MAX_INSN_BYTES];
        rawbytes[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            pc,
            size: bytes.len() as u32,
            rawbytes,
        })
    }

    /// The instruction's encoding without padding
    pub fn bytes(&self) -> &[u8] {
        &self.rawbytes[..(self.size as usize).min(MAX_INSN_BYTES)]
    }
}

impl FixedRecord for RawByteMapEntry {
    const STREAM: StreamKind = StreamKind::RawByteMap;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write_to(&self, out: &mut [u8]) {
        let mut w = FieldWriter::new(out);
        w.u64(self.pc);
        w.u32(self.size);
        w.bytes(&self.rawbytes);
        w.u32(0);
    }
}

impl DecodeRecord for RawByteMapEntry {
    const SIZE: usize = 32;

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut r = FieldReader::new(bytes);
        let pc = r.u64();
        let size = r.u32();
        if size as usize > MAX_INSN_BYTES {
            return None;
        }
        let mut rawbytes = [0u8; MAX_INSN_BYTES];
        rawbytes.copy_from_slice(r.bytes(MAX_INSN_BYTES));
        Some(Self { pc, size, rawbytes })
    }
}

/// Header written as the first bytes of every session's metadata file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub arch: Arch,
    pub version: u32,
}

impl SessionMetadata {
    pub const SIZE: usize = 8;

    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            version: FORMAT_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = FieldWriter::new(&mut out);
        w.u32(self.arch.tag());
        w.u32(self.version);
        out
    }

    /// Write the header to a freshly created metadata file
    pub fn write(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.encode())?;
        writer.flush()
    }

    /// Decode the header from the leading bytes of a metadata file
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut r = FieldReader::new(bytes);
        let arch = Arch::from_tag(r.u32())?;
        Some(Self {
            arch,
            version: r.u32(),
        })
    }
}

/// One parent/child edge in the process-tree log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct ProcessTreeEntry {
    pub parent: u32,
    pub child: u32,
}

impl fmt::Display for ProcessTreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.parent, self.child)
    }
}

impl FromStr for ProcessTreeEntry {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let (parent, child) = line
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("missing '-' in process tree line: {:?}", line))?;
        Ok(Self {
            parent: parent
                .parse()
                .map_err(|e| format!("bad parent pid {:?}: {}", parent, e))?,
            child: child
                .parse()
                .map_err(|e| format!("bad child pid {:?}: {}", child, e))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<R: FixedRecord>(record: &R) -> Vec<u8> {
        let mut out = vec![0u8; record.encoded_len()];
        record.write_to(&mut out);
        out
    }

    #[test]
    fn test_stream_file_names_are_distinct() {
        let mut names: Vec<_> = StreamKind::ALL.iter().map(|k| k.file_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_memory_detail_layout() {
        let detail = MemoryAccessDetail {
            addr: 0x7fff_0010,
            value: 0,
            size: 8,
            direction: AccessDirection::Write,
            pc: 0x401000,
        };
        let bytes = encode(&detail);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..8], &0x7fff_0010u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &8u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
        assert_eq!(&bytes[24..32], &0x401000u64.to_le_bytes());
        assert_eq!(MemoryAccessDetail::decode(&bytes), Some(detail));
    }

    #[test]
    fn test_memory_detail_rejects_unknown_direction() {
        let mut bytes = vec![0u8; 32];
        bytes[20] = 7;
        assert!(MemoryAccessDetail::decode(&bytes).is_none());
    }

    #[test]
    fn test_raw_byte_map_entry_caps_length() {
        let entry = RawByteMapEntry::new(0x1000, &[0x48, 0x89, 0xe5]).unwrap();
        assert_eq!(entry.size, 3);
        assert_eq!(entry.bytes(), &[0x48, 0x89, 0xe5]);
        assert_eq!(RawByteMapEntry::decode(&encode(&entry)), Some(entry));

        let err = RawByteMapEntry::new(0x1000, &[0x90; 17]).unwrap_err();
        assert!(matches!(err, TraceError::MalformedRecord { actual: 17, .. }));
    }

    #[test]
    fn test_instruction_record_is_pointer_width() {
        assert_eq!(InstructionRef::record_size(Arch::Amd64), InstructionRef::SIZE);
        assert_eq!(InstructionRef::record_size(Arch::AArch64), 8);
        assert_eq!(InstructionRef::record_size(Arch::X86), InstructionRef32::SIZE);

        let narrow = InstructionRef32 { pc: 0x0804_8000 };
        let bytes = encode(&narrow);
        assert_eq!(bytes, 0x0804_8000u32.to_le_bytes());
        let decoded = InstructionRef32::decode(&bytes).unwrap();
        assert_eq!(InstructionRef::from(decoded).pc, 0x0804_8000);
    }

    #[test]
    fn test_metadata_header() {
        let meta = SessionMetadata::new(Arch::Amd64);
        let mut file = Vec::new();
        meta.write(&mut file).unwrap();
        assert_eq!(file, vec![1, 0, 0, 0, FORMAT_VERSION as u8, 0, 0, 0]);
        assert_eq!(SessionMetadata::decode(&file), Some(meta));
        assert_eq!(SessionMetadata::decode(&file[..4]), None);
    }

    #[test]
    fn test_process_tree_entry_text() {
        let entry = ProcessTreeEntry {
            parent: 100,
            child: 4242,
        };
        assert_eq!(entry.to_string(), "100-4242");
        assert_eq!("100-4242\n".parse::<ProcessTreeEntry>(), Ok(entry));
        assert!("1004242".parse::<ProcessTreeEntry>().is_err());
        assert!("a-1".parse::<ProcessTreeEntry>().is_err());
    }
}
