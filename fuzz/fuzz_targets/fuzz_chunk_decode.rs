#![no_main]

use libfuzzer_sys::fuzz_target;
use reverb::capture::TrafficChunk;

fuzz_target!(|data: &[u8]| {
    // Fuzz capture record decoding
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<TrafficChunk>(s);
    }
});
