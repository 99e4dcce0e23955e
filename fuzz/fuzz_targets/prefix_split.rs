#![no_main]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use scipass_core::prefix::Prefix;

#[derive(Arbitrary, Debug)]
enum FuzzAddr {
    V4(u32),
    V6(u128),
}

#[derive(Arbitrary, Debug)]
struct FuzzPrefix {
    addr: FuzzAddr,
    len: u8,
}

fuzz_target!(|input: FuzzPrefix| {
    let addr = match input.addr {
        FuzzAddr::V4(bits) => IpAddr::V4(Ipv4Addr::from(bits)),
        FuzzAddr::V6(bits) => IpAddr::V6(Ipv6Addr::from(bits)),
    };
    let Ok(prefix) = Prefix::new(addr, input.len) else {
        return;
    };
    assert!(prefix.contains_addr(&addr));

    if let Some((left, right)) = prefix.split() {
        assert_eq!(left.prefix_len(), prefix.prefix_len() + 1);
        assert!(prefix.contains(&left));
        assert!(prefix.contains(&right));
        assert!(!left.overlaps(&right));
        assert_eq!(left.host_units() + right.host_units(), prefix.host_units());
    } else {
        assert_eq!(prefix.prefix_len(), prefix.family().max_len());
    }
});
