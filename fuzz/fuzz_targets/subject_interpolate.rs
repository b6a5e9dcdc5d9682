#![no_main]

use libfuzzer_sys::fuzz_target;
use nimsforest_types::subject;
use serde_json::Value;

fuzz_target!(|data: (String, String, String)| {
    let (pattern, key, value) = data;
    let mut fields = serde_json::Map::new();
    fields.insert(key, Value::String(value.clone()));
    let output = Value::Object(fields);

    let once = subject::interpolate(&pattern, &output);
    // Once every resolvable field is substituted, re-interpolation is a
    // no-op (unless the substituted value itself introduced a placeholder).
    if !value.contains('{') {
        let twice = subject::interpolate(&once, &output);
        assert_eq!(once, twice);
    }
});
