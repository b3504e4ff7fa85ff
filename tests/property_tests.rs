//! Property-based tests for the recording pipeline
//!
//! Properties covered:
//! 1. Buffer overflow hands records to the flush callback in order
//! 2. Recorded instruction streams match program order for any capacity
//! 3. Stream files never hold a partial record
//! 4. Memory details always add up to the stored reference counts

use peekaboo::buffer::TraceBuffer;
use peekaboo::config::{BufferCapacities, TraceConfig};
use peekaboo::context::ProcessContext;
use peekaboo::reader::TraceReader;
use peekaboo::record::{DecodeRecord, InstructionRef, StreamKind};
use peekaboo::synthetic::{SyntheticHost, SyntheticProgram};
use peekaboo::tracer::ThreadTracer;
use proptest::prelude::*;
use tempfile::TempDir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_buffer_overflow_preserves_order(
        pcs in prop::collection::vec(any::<u64>(), 1..200),
        capacity in 1usize..32,
    ) {
        let mut buffer = TraceBuffer::new(StreamKind::Instruction, InstructionRef::SIZE, capacity);
        let mut seen = Vec::new();
        let mut flushes = 0usize;

        for &pc in &pcs {
            buffer
                .append(&InstructionRef { pc }, |full| {
                    flushes += 1;
                    seen.extend(full.records::<InstructionRef>().map(|r| r.pc));
                    Ok(())
                })
                .unwrap();
        }

        // Property: a flush happens exactly when an append finds the buffer full
        prop_assert_eq!(flushes, (pcs.len() - 1) / capacity);
        prop_assert!(buffer.len() >= 1 && buffer.len() <= capacity);

        seen.extend(buffer.records::<InstructionRef>().map(|r| r.pc));
        prop_assert_eq!(seen, pcs);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_recorded_trace_is_ordered_and_correlated(
        count in 1u64..600,
        capacity in 1usize..48,
        mem_ops in 0usize..5,
        simd in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let host = SyntheticHost::new(6000, 1, "prop");
        let config = TraceConfig {
            output_dir: dir.path().to_path_buf(),
            capacities: BufferCapacities::uniform(capacity),
            store_simd: simd,
            ..TraceConfig::default()
        };
        let ctx = ProcessContext::initialize(config, &host).unwrap();
        let mut tracer = ThreadTracer::start(ctx.clone(), 6000, host).unwrap();
        let mut program = SyntheticProgram::new(mem_ops);
        program.drive(&mut tracer, 0..count).unwrap();
        tracer.finish().unwrap();

        let reader = TraceReader::open(ctx.trace_root()).unwrap();

        // Property: the reader accepts every stream (no partial records)
        let trace = reader.thread(6000, 6000).unwrap();
        prop_assert_eq!(trace.layout.simd, simd);

        // Property: program order is preserved across flush cycles
        let pcs: Vec<u64> = trace.instructions.iter().map(|i| i.pc).collect();
        let expected: Vec<u64> = (0..count).map(|n| program.address(n)).collect();
        prop_assert_eq!(pcs, expected);

        // Property: counts, details and registers line up
        let violations = reader.verify().unwrap();
        prop_assert!(violations.is_empty(), "{:?}", violations);
        let details: u64 = (0..count).map(|n| program.operand_count(n) as u64).sum();
        prop_assert_eq!(trace.memory_details.len() as u64, details);
    }
}
