#![no_main]

use libfuzzer_sys::fuzz_target;
use peekaboo::arch::{Arch, RegisterLayout, RegisterSnapshot};
use peekaboo::record::{
    DecodeRecord, MemoryAccessDetail, ProcessTreeEntry, RawByteMapEntry, SessionMetadata,
};

fuzz_target!(|data: &[u8]| {
    // Decoders must reject bad input, never panic
    let _ = SessionMetadata::decode(data);
    for chunk in data.chunks(32) {
        let _ = MemoryAccessDetail::decode(chunk);
        if let Some(entry) = RawByteMapEntry::decode(chunk) {
            assert!(entry.bytes().len() <= 16);
        }
    }
    for (simd, fxsave) in [(false, false), (true, false), (true, true)] {
        if let Ok(layout) = RegisterLayout::new(Arch::Amd64, simd, fxsave) {
            let _ = RegisterSnapshot::decode(&layout, data);
        }
    }

    if let Ok(text) = std::str::from_utf8(data) {
        for line in text.lines() {
            let _ = line.parse::<ProcessTreeEntry>();
        }
    }
});
