use js_vmp::{deobfuscate, DeobfuscateOptions, Deobfuscator, RestoreConfig, VmType};

fn dispatch_loop(cases: usize) -> String {
    let mut src = String::from("  var bc = [");
    src.push_str(&(0..60).map(|i| (i % cases).to_string()).collect::<Vec<_>>().join(","));
    src.push_str("];\n  var pc = 0, st = [];\n  while (true) {\n    switch (bc[pc++]) {\n");
    for i in 0..cases {
        src.push_str(&format!("      case {}: st.push(bc[pc]); break;\n", i));
    }
    src.push_str("    }\n  }\n");
    src
}

fn obfuscator_io_sample() -> String {
    format!(
        concat!(
            "var _0x1a2b = [\"foo\",\"bar\"];\n",
            "function _0x4f2c(_0x5e1d) {{\n{}}}\n",
            "console.log(_0x1a2b[0]);\n",
        ),
        dispatch_loop(12)
    )
}

#[test]
fn non_vm_input_is_returned_unchanged() {
    let code = "const greet = (name) => `hello ${name}`;\n";
    let result = deobfuscate(code, &DeobfuscateOptions::default());
    assert!(!result.is_jsvmp);
    assert_eq!(result.deobfuscated_code, code);
    assert_eq!(result.confidence, 0.0);
    assert!(result.vm_type.is_none());
}

#[cfg(feature = "js-sandbox")]
#[test]
fn obfuscator_io_table_is_inlined() {
    let result = deobfuscate(&obfuscator_io_sample(), &DeobfuscateOptions::default());
    assert!(result.is_jsvmp);
    assert_eq!(result.vm_type, Some(VmType::ObfuscatorIo));
    let restored = &result.deobfuscated_code;
    assert!(restored.contains("console.log(\"foo\")"), "{}", restored);
    assert!(result.confidence > 0.1);
    assert_eq!(result.instructions.len(), 12);
    let symbolic = result.symbolic.expect("instructions were replayed");
    assert!(symbolic.steps > 0);
}

#[test]
fn extraction_can_be_skipped() {
    let options =
        DeobfuscateOptions { extract_instructions: false, ..DeobfuscateOptions::default() };
    let result = deobfuscate(&obfuscator_io_sample(), &options);
    assert!(result.instructions.is_empty());
    assert!(result.symbolic.is_none());
    assert!(result.unresolved_parts.iter().all(|p| !p.reason.contains("no instruction handlers")));
}

#[test]
fn custom_vm_reports_unresolved_bytecode() {
    let code = format!("function vm() {{\n{}  if (!![]) {{}}\n}}\n", dispatch_loop(11));
    let result = deobfuscate(&code, &DeobfuscateOptions::default());
    assert_eq!(result.vm_type, Some(VmType::Custom));
    assert!((0.3..=0.45).contains(&result.confidence));
    assert!(result
        .unresolved_parts
        .iter()
        .any(|p| p.suggestion.contains("symbolic executor")));
    assert!(!result.deobfuscated_code.contains("!![]"));
}

#[test]
fn assistant_answers_are_merged() {
    let code = format!("function vm() {{\n{}}}\n", dispatch_loop(11));
    let deob = Deobfuscator::new(RestoreConfig::default()).with_assistant(
        |_: &str| -> anyhow::Result<String> {
            Ok(r#"{"warnings": ["case 3 rotates the key"], "unresolved_parts": []}"#.to_string())
        },
    );
    let result = deob.deobfuscate(&code, &DeobfuscateOptions::default());
    assert_eq!(result.confidence, 0.6);
    assert!(result.warnings.iter().any(|w| w.contains("case 3 rotates the key")));

    let silent = Deobfuscator::default()
        .with_assistant(|_: &str| -> anyhow::Result<String> { Ok("maybe?".into()) });
    let fallback = silent.deobfuscate(&code, &DeobfuscateOptions::default());
    assert!(fallback.confidence < 0.6);
}

#[cfg(feature = "js-sandbox")]
#[test]
fn jjencode_entry_point_is_called() {
    let code = format!(
        "{}$.$($.$(\"return\\\"{}\\\"\")())();\n",
        JJENCODE_PRELUDE,
        "\\\\x61\\\\x6c\\\\x65\\\\x72\\\\x74\\\\x28\\\\x31\\\\x29"
    );
    let result = Deobfuscator::default().restore_as(
        &code,
        VmType::JjEncode,
        &DeobfuscateOptions::default(),
    );
    assert_eq!(result.code, "alert(1)");
    assert_eq!(result.confidence, 0.9);
}

const JJENCODE_PRELUDE: &str =
    "$=~[];$={___:++$};$.$=($.___)[\"constructor\"][\"constructor\"];\n";

#[cfg(feature = "js-sandbox")]
#[test]
fn throwing_jjencode_payload_keeps_the_input() {
    let code = format!("{}$.$($.$(undefinedPayload)())();\n", JJENCODE_PRELUDE);
    let result = Deobfuscator::default().restore_as(
        &code,
        VmType::JjEncode,
        &DeobfuscateOptions::default(),
    );
    assert_eq!(result.code, code);
    assert!(result.confidence <= 0.2);
    assert!(!result.warnings.is_empty());
    assert!(result.unresolved_parts.is_empty());
}

#[cfg(feature = "js-sandbox")]
#[test]
fn looping_jjencode_payload_times_out() {
    let code = format!(
        "{}$.$($.$((function () {{ while (true) {{}} }})())())();\n",
        JJENCODE_PRELUDE
    );
    let options = DeobfuscateOptions { timeout_ms: 50, ..DeobfuscateOptions::default() };
    let result = Deobfuscator::default().restore_as(&code, VmType::JjEncode, &options);
    assert_eq!(result.code, code);
    assert!(result.confidence <= 0.2);
    assert!(!result.warnings.is_empty());
    assert!(result
        .unresolved_parts
        .iter()
        .any(|p| p.reason == "payload evaluation timed out"));
}

#[test]
fn quotes_inside_regex_literals_do_not_shift_strings() {
    let code = "var ok = /'/.test(x); var s = '!0'; var t = !0;";
    let result = Deobfuscator::default().restore_as(
        code,
        VmType::Custom,
        &DeobfuscateOptions::default(),
    );
    assert!(result.code.contains("/'/.test(x)"), "{}", result.code);
    assert!(result.code.contains("var s = '!0';"), "{}", result.code);
    assert!(result.code.contains("var t = true;"), "{}", result.code);
}

#[test]
fn jjencode_without_marker_degrades() {
    let code = "$=~[];\n$.$$ = 1;\n";
    let result =
        Deobfuscator::default().restore_as(code, VmType::JjEncode, &DeobfuscateOptions::default());
    assert_eq!(result.code, code);
    assert_eq!(result.confidence, 0.1);
    assert_eq!(result.warnings.len(), 1);
}

#[cfg(feature = "js-sandbox")]
#[test]
fn jsfuck_string_is_evaluated() {
    let code = "(![]+[])[+[]]+(![]+[])[!+[]+!+[]]";
    let result =
        Deobfuscator::default().restore_as(code, VmType::JsFuck, &DeobfuscateOptions::default());
    assert_eq!(result.code, "fl");
    assert_eq!(result.confidence, 0.9);
}

#[test]
fn repeated_runs_agree() {
    let sample = obfuscator_io_sample();
    let deob = Deobfuscator::default();
    let options = DeobfuscateOptions { aggressive: true, ..DeobfuscateOptions::default() };
    let first = deob.deobfuscate(&sample, &options);
    let second = deob.deobfuscate(&sample, &options);
    assert_eq!(first.deobfuscated_code, second.deobfuscated_code);
    assert_eq!(first.confidence, second.confidence);
}

#[test]
fn confidence_is_always_bounded() {
    let deob = Deobfuscator::default();
    let options = DeobfuscateOptions { timeout_ms: 200, ..DeobfuscateOptions::default() };
    let inputs = [
        String::new(),
        "}{".to_string(),
        obfuscator_io_sample(),
        format!("function vm() {{\n{}}}\n", dispatch_loop(30)),
        "[][[]]".repeat(10),
    ];
    for input in &inputs {
        let result = deob.deobfuscate(input, &options);
        assert!((0.0..=1.0).contains(&result.confidence));
        for vm_type in [VmType::ObfuscatorIo, VmType::JsFuck, VmType::JjEncode, VmType::Custom] {
            let restored = deob.restore_as(input, vm_type, &options);
            assert!((0.0..=1.0).contains(&restored.confidence));
        }
    }
}

#[test]
fn results_serialize_to_json() {
    let result = deobfuscate(&obfuscator_io_sample(), &DeobfuscateOptions::default());
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["vm_type"], "obfuscator.io");
    assert_eq!(json["is_jsvmp"], true);
    assert!(json["stats"]["original_size"].as_u64().unwrap() > 0);
}
