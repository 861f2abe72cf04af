#![no_main]

use dtcp_core::ake::AkeFrame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // AKE frame parsing must never panic on arbitrary input.
    let _ = AkeFrame::parse(data);
});
