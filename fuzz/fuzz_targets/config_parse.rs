#![no_main]

use libfuzzer_sys::fuzz_target;
use nimsforest::config::load_config_str;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = load_config_str(text, std::path::Path::new("/tmp"));
    }
});
