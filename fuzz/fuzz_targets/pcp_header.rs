#![no_main]

use dtcp_core::PcpHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // PCP header parsing must never panic on arbitrary input.
    let _ = PcpHeader::parse(data);
});
