#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let src = String::from_utf8_lossy(data);
    let options = js_vmp::DeobfuscateOptions { timeout_ms: 100, ..Default::default() };
    let result = js_vmp::deobfuscate(&src, &options);
    assert!((0.0..=1.0).contains(&result.confidence));
});
