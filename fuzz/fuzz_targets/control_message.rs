//! Fuzz target for control-message decoding
//!
//! Tests that the ancillary data decoder handles arbitrary buffers in either
//! byte order without panicking or reading outside the input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sockio::cmsg::{self, ByteOrder, ControlSummary};

fuzz_target!(|data: &[u8]| {
    for order in [ByteOrder::Little, ByteOrder::Big] {
        for message in cmsg::RawMessages::new(data, order) {
            let _ = cmsg::AncillaryRecord::classify(&message, order);
        }
        let _: ControlSummary = cmsg::decode_with(data, order).collect();
    }

    let _ = cmsg::parse_ipv4_pktinfo(data, ByteOrder::NATIVE);
    let _ = cmsg::parse_ipv6_pktinfo(data, ByteOrder::NATIVE);
});
