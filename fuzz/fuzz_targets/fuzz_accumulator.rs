#![no_main]

use libfuzzer_sys::fuzz_target;
use reverb::accumulate::TrafficAccumulator;
use reverb::capture::TrafficChunk;
use reverb::config::AccumulationConfig;

// Decoded chunks drive the state machine; the machine must never panic on
// any observation ordering.
fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let mut chunks = Vec::new();
    for line in s.lines() {
        if let Ok(chunk) = serde_json::from_str::<TrafficChunk>(line) {
            chunks.push(chunk);
        }
    }
    if chunks.is_empty() {
        return;
    }

    let accumulator = TrafficAccumulator::new(&AccumulationConfig::default(), |_pair| {});
    for chunk in &chunks {
        accumulator.accept(chunk);
    }
    accumulator.finish();
});
