#![no_main]

use libfuzzer_sys::fuzz_target;
use scipass_coordinator::FlowSignal;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(signal) = FlowSignal::parse_json(s) {
            // a header is only built for same-family endpoints
            if let Ok(header) = signal.header() {
                let _ = header.to_string();
            }
            let _ = signal.to_string();
        }
    }
});
