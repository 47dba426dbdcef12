#![no_main]

use libfuzzer_sys::fuzz_target;
use telescope_report::Config;

// Arbitrary documents must either parse into a valid config or fail
// cleanly; validation must never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = Config::from_toml(text) {
        let _ = config.validate();
    }
});
