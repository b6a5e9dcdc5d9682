#![no_main]

use libfuzzer_sys::fuzz_target;
use nimsforest_duration::parse_duration;

fuzz_target!(|data: &str| {
    let _ = parse_duration(data);
});
