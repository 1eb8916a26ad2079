#![no_main]
use libfuzzer_sys::fuzz_target;

// Detection and handler extraction over arbitrary source, AST path with
// lexical fallback on parse failure.
fuzz_target!(|data: &[u8]| {
    let src = String::from_utf8_lossy(data);
    if let Some(features) = js_vmp::detect(&src) {
        let _ = js_vmp::identify_vm_type(&src, &features);
        let instructions = js_vmp::extract_instructions(&src, &features);
        let _ = js_vmp::execute_jsvmp(&instructions, 256, 1_000);
    }
});
