//! Fuzz test for socket configuration parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics when parsed and
//! validated as a socket configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sockio::SocketConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<SocketConfig>(s) {
            if config.validate().is_ok() {
                let _ = config.batch_limits();
                let _ = config.read_timeout();
            }
        }
    }
});
