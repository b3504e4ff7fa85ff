//! Capture hot-path benchmark
//!
//! Measures the per-instruction cost of the recording path:
//!
//! 1. `TraceBuffer::append` of a single fixed-size record
//! 2. a full `ThreadTracer::on_instruction` (details, instruction reference,
//!    count and register snapshot), including the amortized flush cost
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench buffer_append
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use peekaboo::arch::{Arch, RegisterLayout};
use peekaboo::buffer::TraceBuffer;
use peekaboo::config::{BufferCapacities, TraceConfig};
use peekaboo::context::ProcessContext;
use peekaboo::host::{InstructionEvent, MemoryOperand};
use peekaboo::record::{DecodeRecord, FixedRecord, InstructionRef, StreamKind};
use peekaboo::synthetic::SyntheticHost;
use peekaboo::tracer::ThreadTracer;
use tempfile::TempDir;

/// Benchmark: append one instruction reference (never fills)
fn bench_buffer_append(c: &mut Criterion) {
    let mut buffer = TraceBuffer::new(StreamKind::Instruction, InstructionRef::SIZE, 8192);
    let mut pc = 0u64;

    c.bench_function("buffer_append", |b| {
        b.iter(|| {
            buffer
                .append(&InstructionRef { pc: black_box(pc) }, |_| Ok(()))
                .unwrap();
            if buffer.is_full() {
                buffer.reset();
            }
            pc += 4;
        });
    });
}

/// Benchmark: append a register snapshot for each AMD64 layout
fn bench_register_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_append");

    for (name, simd, fxsave) in [("gpr", false, false), ("simd", true, false), ("full", true, true)] {
        let layout = RegisterLayout::new(Arch::Amd64, simd, fxsave).unwrap();
        let snapshot = layout.empty_snapshot();
        group.bench_with_input(BenchmarkId::from_parameter(name), &snapshot, |b, snapshot| {
            let mut buffer =
                TraceBuffer::new(StreamKind::Register, snapshot.encoded_len(), 8192);
            b.iter(|| {
                buffer.append(black_box(snapshot), |_| Ok(())).unwrap();
                if buffer.is_full() {
                    buffer.reset();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: full per-instruction capture with flushes to a temp dir
fn bench_on_instruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("on_instruction");

    for capacity in [256, 1024, 8192] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                let dir = TempDir::new().unwrap();
                let host = SyntheticHost::new(1, 0, "bench");
                let config = TraceConfig {
                    output_dir: dir.path().to_path_buf(),
                    capacities: BufferCapacities::uniform(capacity),
                    copy_memory_map: false,
                    ..TraceConfig::default()
                };
                let ctx = ProcessContext::initialize(config, &host).unwrap();
                let mut tracer = ThreadTracer::start(ctx, 1, host).unwrap();
                let operands = [MemoryOperand::read(0x7000, 8)];
                let mut address = 0x40_0000u64;

                b.iter(|| {
                    tracer
                        .on_instruction(&InstructionEvent {
                            address: black_box(address),
                            length: 4,
                            raw_bytes: &[0x48, 0x8b, 0x07, 0x90],
                            operands: &operands,
                        })
                        .unwrap();
                    address += 4;
                });

                tracer.finish().unwrap();
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_buffer_append,
    bench_register_append,
    bench_on_instruction
);
criterion_main!(benches);
