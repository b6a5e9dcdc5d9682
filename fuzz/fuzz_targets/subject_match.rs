#![no_main]

use libfuzzer_sys::fuzz_target;
use nimsforest_types::subject;

fuzz_target!(|data: (String, String)| {
    let (pattern, subj) = data;
    let _ = subject::matches(&pattern, &subj);
    let _ = subject::validate_subject(&subj);
    let _ = subject::validate_pattern(&pattern);
});
