#![no_main]

use libfuzzer_sys::fuzz_target;
use telescope_report::GeoAsnWhitelist;

// Whitelist parsing tolerates any input without panicking.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let list = GeoAsnWhitelist::parse(text);
    let _ = list.allows(0x4155, 64_512);
    let _ = list.is_empty();
});
