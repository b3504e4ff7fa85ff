#![no_main]

use libfuzzer_sys::fuzz_target;
use peekaboo::buffer::TraceBuffer;
use peekaboo::record::{DecodeRecord, MemoryAccessDetail, StreamKind};

fuzz_target!(|input: (u8, Vec<MemoryAccessDetail>)| {
    let (capacity, details) = input;
    let capacity = capacity as usize % 64 + 1;
    let mut buffer = TraceBuffer::new(StreamKind::MemoryDetail, MemoryAccessDetail::SIZE, capacity);

    // Records drained on overflow plus those still held must equal the input
    let mut seen = Vec::new();
    for detail in &details {
        buffer
            .append(detail, |full| {
                seen.extend(full.records::<MemoryAccessDetail>());
                Ok(())
            })
            .unwrap();
    }
    seen.extend(buffer.records::<MemoryAccessDetail>());
    assert_eq!(seen, details);
});
