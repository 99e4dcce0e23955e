#![no_main]

use libfuzzer_sys::fuzz_target;
use scipass_core::config::ScipassConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = ScipassConfig::parse(s) {
            if config.validate().is_ok() {
                for switch in &config.switches {
                    assert!(switch.switch_id().is_ok());
                }
            }
        }
    }
});
