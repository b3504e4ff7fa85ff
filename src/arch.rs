//! Architecture tags and per-architecture register-file snapshots
//!
//! The register stream stores one [`RegisterSnapshot`] per executed
//! instruction. Each architecture has a single fixed byte layout, selected
//! once at startup through a [`RegisterLayout`]; extended state (YMM slots,
//! FXSAVE area) is part of the layout, never toggled per record.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TraceError};
use crate::record::{FieldReader, FieldWriter, FixedRecord, StreamKind};

/// Number of YMM slots saved on AMD64 when SIMD capture is enabled
pub const AMD64_SIMD_SLOTS: usize = 16;
/// Bytes per YMM slot
pub const AMD64_YMM_BYTES: usize = 32;
/// Size of the legacy FXSAVE area
pub const FXSAVE_BYTES: usize = 512;
/// Number of V registers saved on AArch64
pub const AARCH64_SIMD_SLOTS: usize = 32;
/// Bytes per AArch64 V register
pub const AARCH64_V_BYTES: usize = 16;

const AMD64_GPR_BYTES: usize = 18 * 8;
const X86_GPR_BYTES: usize = 8 * 4;
const AARCH64_GPR_BYTES: usize = 33 * 8 + 3 * 4;

/// CPU architecture identifier written into every session's metadata
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    X86 = 0,
    Amd64 = 1,
    AArch32 = 2,
    AArch64 = 3,
}

impl Arch {
    /// Architecture of the machine this crate was built for
    pub fn detect() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::Amd64
        } else if cfg!(target_arch = "x86") {
            Arch::X86
        } else if cfg!(target_arch = "aarch64") {
            Arch::AArch64
        } else {
            Arch::AArch32
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Arch::X86),
            1 => Some(Arch::Amd64),
            2 => Some(Arch::AArch32),
            3 => Some(Arch::AArch64),
            _ => None,
        }
    }

    /// Width of an address on this architecture, in bytes
    pub fn pointer_width(self) -> usize {
        match self {
            Arch::X86 | Arch::AArch32 => 4,
            Arch::Amd64 | Arch::AArch64 => 8,
        }
    }

    /// Number of vector register slots the register file can carry
    pub fn simd_slots(self) -> usize {
        match self {
            Arch::Amd64 => AMD64_SIMD_SLOTS,
            Arch::AArch64 => AARCH64_SIMD_SLOTS,
            Arch::X86 | Arch::AArch32 => 0,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::X86 => "X86",
            Arch::Amd64 => "AMD64",
            Arch::AArch32 => "AArch32",
            Arch::AArch64 => "AArch64",
        };
        write!(f, "{}", name)
    }
}

/// Fixed register-file layout for one tracing run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub arch: Arch,
    pub simd: bool,
    pub fxsave: bool,
}

impl RegisterLayout {
    /// Build the layout for `arch`
    ///
    /// SIMD and FXSAVE capture are AMD64 options; AArch64 always carries its
    /// V registers and X86 carries general-purpose registers only. AArch32
    /// has no register layout.
    pub fn new(arch: Arch, simd: bool, fxsave: bool) -> Result<Self> {
        match arch {
            Arch::AArch32 => Err(TraceError::Config(
                "no register-file layout for AArch32".to_string(),
            )),
            Arch::Amd64 => Ok(Self { arch, simd, fxsave }),
            Arch::AArch64 => Ok(Self {
                arch,
                simd: true,
                fxsave: false,
            }),
            Arch::X86 => Ok(Self {
                arch,
                simd: false,
                fxsave: false,
            }),
        }
    }

    /// Size in bytes of one encoded snapshot
    pub fn record_size(&self) -> usize {
        match self.arch {
            Arch::Amd64 => {
                let mut size = AMD64_GPR_BYTES;
                if self.simd {
                    size += AMD64_SIMD_SLOTS * AMD64_YMM_BYTES;
                }
                if self.fxsave {
                    size += FXSAVE_BYTES;
                }
                size
            }
            Arch::X86 => X86_GPR_BYTES,
            Arch::AArch64 => AARCH64_GPR_BYTES + AARCH64_SIMD_SLOTS * AARCH64_V_BYTES,
            Arch::AArch32 => 0,
        }
    }

    /// An all-zero snapshot matching this layout
    pub fn empty_snapshot(&self) -> RegisterSnapshot {
        match self.arch {
            Arch::Amd64 => RegisterSnapshot::Amd64(Amd64Regs {
                gpr: Amd64Gpr::default(),
                simd: self
                    .simd
                    .then(|| Box::new([[0u8; AMD64_YMM_BYTES]; AMD64_SIMD_SLOTS])),
                fxsave: self.fxsave.then(|| Box::new([0u8; FXSAVE_BYTES])),
            }),
            Arch::X86 | Arch::AArch32 => RegisterSnapshot::X86(X86Regs::default()),
            Arch::AArch64 => RegisterSnapshot::AArch64(AArch64Regs::default()),
        }
    }
}

/// AMD64 general-purpose registers, in stored order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Amd64Gpr {
    pub rdi: u64,
    pub rsi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    /// Address of the next instruction, not the hardware RIP
    pub rip: u64,
}

impl Amd64Gpr {
    fn fields(&self) -> [u64; 18] {
        [
            self.rdi, self.rsi, self.rsp, self.rbp, self.rbx, self.rdx, self.rcx, self.rax,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
            self.rflags, self.rip,
        ]
    }

    fn from_fields(f: [u64; 18]) -> Self {
        Self {
            rdi: f[0],
            rsi: f[1],
            rsp: f[2],
            rbp: f[3],
            rbx: f[4],
            rdx: f[5],
            rcx: f[6],
            rax: f[7],
            r8: f[8],
            r9: f[9],
            r10: f[10],
            r11: f[11],
            r12: f[12],
            r13: f[13],
            r14: f[14],
            r15: f[15],
            rflags: f[16],
            rip: f[17],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amd64Regs {
    pub gpr: Amd64Gpr,
    pub simd: Option<Box<[[u8; AMD64_YMM_BYTES]; AMD64_SIMD_SLOTS]>>,
    pub fxsave: Option<Box<[u8; FXSAVE_BYTES]>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86Regs {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AArch64Regs {
    pub x: [u64; 31],
    pub sp: u64,
    /// Address of the next instruction, not the hardware PC
    pub pc: u64,
    pub nzcv: u32,
    pub fpcr: u32,
    pub fpsr: u32,
    pub v: Box<[[u8; AARCH64_V_BYTES]; AARCH64_SIMD_SLOTS]>,
}

impl Default for AArch64Regs {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            nzcv: 0,
            fpcr: 0,
            fpsr: 0,
            v: Box::new([[0; AARCH64_V_BYTES]; AARCH64_SIMD_SLOTS]),
        }
    }
}

/// Register file captured after one instruction, tagged by architecture
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterSnapshot {
    X86(X86Regs),
    Amd64(Amd64Regs),
    AArch64(AArch64Regs),
}

impl RegisterSnapshot {
    pub fn arch(&self) -> Arch {
        match self {
            Self::X86(_) => Arch::X86,
            Self::Amd64(_) => Arch::Amd64,
            Self::AArch64(_) => Arch::AArch64,
        }
    }

    /// Overwrite the AMD64 `rip` slot with the next instruction's address
    ///
    /// AArch64 keeps the `pc` the host captured; X86 snapshots carry no
    /// program-counter slot.
    pub fn set_next_pc(&mut self, next_pc: u64) {
        if let Self::Amd64(regs) = self {
            regs.gpr.rip = next_pc;
        }
    }

    /// Program-counter slot, if the architecture has one
    pub fn pc(&self) -> Option<u64> {
        match self {
            Self::Amd64(regs) => Some(regs.gpr.rip),
            Self::AArch64(regs) => Some(regs.pc),
            Self::X86(_) => None,
        }
    }

    /// Whether this snapshot encodes to exactly `layout`
    pub fn matches(&self, layout: &RegisterLayout) -> bool {
        self.arch() == layout.arch && self.encoded_len() == layout.record_size()
    }

    /// Decode one snapshot laid out as `layout`
    pub fn decode(layout: &RegisterLayout, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != layout.record_size() {
            return None;
        }
        let mut r = FieldReader::new(bytes);
        let snapshot = match layout.arch {
            Arch::Amd64 => {
                let mut f = [0u64; 18];
                for slot in f.iter_mut() {
                    *slot = r.u64();
                }
                let simd = layout.simd.then(|| {
                    let mut ymm = Box::new([[0u8; AMD64_YMM_BYTES]; AMD64_SIMD_SLOTS]);
                    for slot in ymm.iter_mut() {
                        slot.copy_from_slice(r.bytes(AMD64_YMM_BYTES));
                    }
                    ymm
                });
                let fxsave = layout.fxsave.then(|| {
                    let mut area = Box::new([0u8; FXSAVE_BYTES]);
                    area.copy_from_slice(r.bytes(FXSAVE_BYTES));
                    area
                });
                Self::Amd64(Amd64Regs {
                    gpr: Amd64Gpr::from_fields(f),
                    simd,
                    fxsave,
                })
            }
            Arch::X86 => Self::X86(X86Regs {
                eax: r.u32(),
                ecx: r.u32(),
                edx: r.u32(),
                ebx: r.u32(),
                esp: r.u32(),
                ebp: r.u32(),
                esi: r.u32(),
                edi: r.u32(),
            }),
            Arch::AArch64 => {
                let mut regs = AArch64Regs::default();
                for x in regs.x.iter_mut() {
                    *x = r.u64();
                }
                regs.sp = r.u64();
                regs.pc = r.u64();
                regs.nzcv = r.u32();
                regs.fpcr = r.u32();
                regs.fpsr = r.u32();
                for v in regs.v.iter_mut() {
                    v.copy_from_slice(r.bytes(AARCH64_V_BYTES));
                }
                Self::AArch64(regs)
            }
            Arch::AArch32 => return None,
        };
        Some(snapshot)
    }
}

impl FixedRecord for RegisterSnapshot {
    const STREAM: StreamKind = StreamKind::Register;

    fn encoded_len(&self) -> usize {
        match self {
            Self::Amd64(regs) => {
                AMD64_GPR_BYTES
                    + regs
                        .simd
                        .as_ref()
                        .map_or(0, |_| AMD64_SIMD_SLOTS * AMD64_YMM_BYTES)
                    + regs.fxsave.as_ref().map_or(0, |_| FXSAVE_BYTES)
            }
            Self::X86(_) => X86_GPR_BYTES,
            Self::AArch64(_) => AARCH64_GPR_BYTES + AARCH64_SIMD_SLOTS * AARCH64_V_BYTES,
        }
    }

    fn write_to(&self, out: &mut [u8]) {
        let mut w = FieldWriter::new(out);
        match self {
            Self::Amd64(regs) => {
                for value in regs.gpr.fields() {
                    w.u64(value);
                }
                if let Some(simd) = &regs.simd {
                    for slot in simd.iter() {
                        w.bytes(slot);
                    }
                }
                if let Some(area) = &regs.fxsave {
                    w.bytes(&area[..]);
                }
            }
            Self::X86(regs) => {
                for value in [
                    regs.eax, regs.ecx, regs.edx, regs.ebx, regs.esp, regs.ebp, regs.esi, regs.edi,
                ] {
                    w.u32(value);
                }
            }
            Self::AArch64(regs) => {
                for x in regs.x {
                    w.u64(x);
                }
                w.u64(regs.sp);
                w.u64(regs.pc);
                w.u32(regs.nzcv);
                w.u32(regs.fpcr);
                w.u32(regs.fpsr);
                for v in regs.v.iter() {
                    w.bytes(v);
                }
            }
        }
    }
}
