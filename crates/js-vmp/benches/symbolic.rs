use criterion::{criterion_group, criterion_main, Criterion};
use js_vmp::{detect, execute_jsvmp, Operand, VmInstruction};

fn interpreter_source(cases: usize) -> String {
    let mut src = String::from("function run() {\n  var code = [");
    src.push_str(&(0..256).map(|i| (i % cases).to_string()).collect::<Vec<_>>().join(","));
    src.push_str("];\n  var ip = 0, stack = [];\n  while (true) {\n    switch (code[ip++]) {\n");
    for i in 0..cases {
        src.push_str(&format!("      case {}: stack.push(stack.pop() ^ {}); break;\n", i, i));
    }
    src.push_str("    }\n  }\n}\n");
    src
}

fn bench_symbolic(c: &mut Criterion) {
    let mut program = Vec::new();
    for i in 0..512 {
        program.push(VmInstruction::op("PUSH", vec![Operand::Number(i as f64)]));
        program.push(VmInstruction::op("XOR", Vec::new()));
        program.push(VmInstruction::op("STORE", vec![Operand::Text(format!("r{}", i % 8))]));
        program.push(VmInstruction::op("LOAD", vec![Operand::Text(format!("r{}", i % 8))]));
    }
    c.bench_function("js_vmp_symbolic_2k", |b| b.iter(|| execute_jsvmp(&program, 10_000, 60_000)));

    let src = interpreter_source(64);
    c.bench_function("js_vmp_detect_64_cases", |b| b.iter(|| detect(&src)));
}

criterion_group!(benches, bench_symbolic);
criterion_main!(benches);
