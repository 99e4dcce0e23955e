#![no_main]

use libfuzzer_sys::fuzz_target;
use scipass_core::prefix::Prefix;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(prefix) = s.parse::<Prefix>() {
            // rendering is canonical: it parses back to the same prefix
            let again: Prefix = prefix
                .to_string()
                .parse()
                .expect("rendered prefix must parse");
            assert_eq!(prefix, again);
            assert!(prefix.contains(&again));
        }
    }
});
