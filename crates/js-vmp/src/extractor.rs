use regex::Regex;
use tracing::{debug, instrument};

use crate::detector::switch_body;
use crate::lexical::{literal_text, CodeMap, LiteralText};
use crate::types::{InstructionKind, Opcode, VmFeatures, VmInstruction};

/// What a case body was observed to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BodyShape {
    pushes: bool,
    indexed_read: bool,
    assigns: bool,
    arithmetic: bool,
    /// `continue`, `if`, `while` or `return`
    control: bool,
    /// `break` alone terminates every case, so it only decides the kind of
    /// bodies with no other effect
    breaks: bool,
    calls: bool,
}

impl BodyShape {
    fn kind(&self) -> InstructionKind {
        if self.pushes && self.indexed_read {
            InstructionKind::Load
        } else if self.assigns && !self.arithmetic && !self.calls {
            InstructionKind::Store
        } else if self.arithmetic {
            InstructionKind::Arithmetic
        } else if self.control {
            InstructionKind::Control
        } else if self.calls {
            InstructionKind::Call
        } else if self.breaks {
            InstructionKind::Control
        } else {
            InstructionKind::Unknown
        }
    }

    fn describe(&self) -> String {
        match self.kind() {
            InstructionKind::Load => "pushes an indexed read onto the stack".into(),
            InstructionKind::Store => "assigns a value without computing it".into(),
            InstructionKind::Arithmetic => "applies a binary operator".into(),
            InstructionKind::Control => "alters the interpreter control flow".into(),
            InstructionKind::Call => "invokes a function".into(),
            InstructionKind::Unknown => "no recognised effect".into(),
        }
    }
}

fn instruction(index: usize, label: Option<LiteralText>, shape: BodyShape) -> VmInstruction {
    let opcode = match label {
        Some(LiteralText::Number(n)) => Opcode::Number(n),
        Some(LiteralText::Text(s)) => Opcode::Text(s),
        None => Opcode::Number(index as f64),
    };
    VmInstruction {
        name: format!("op_{}", opcode),
        opcode,
        kind: shape.kind(),
        description: shape.describe(),
        operands: Vec::new(),
    }
}

/// Lifts the cases of the interpreter switch into a flat instruction list.
/// Returns an empty list when no switch with `features.instruction_count`
/// cases can be found.
#[instrument(skip_all, fields(expected = features.instruction_count))]
pub fn extract_instructions(code: &str, features: &VmFeatures) -> Vec<VmInstruction> {
    #[cfg(feature = "js-ast")]
    {
        if let Some(instructions) = ast_extract::extract(code, features.instruction_count) {
            debug!(count = instructions.len(), "instructions extracted from ast");
            return instructions;
        }
    }
    let instructions = regex_extract(code, features.instruction_count);
    debug!(count = instructions.len(), "instructions extracted lexically");
    instructions
}

pub(crate) fn regex_extract(code: &str, expected: usize) -> Vec<VmInstruction> {
    let map = CodeMap::new(code);
    let masked = map.masked();
    let Some((labels, close)) = map
        .keyword_offsets("switch")
        .into_iter()
        .filter_map(|offset| switch_body(&map, offset))
        .find(|(labels, _)| labels.len() == expected && expected > 0)
    else {
        return Vec::new();
    };

    let patterns = LexicalPatterns::compile();
    labels
        .iter()
        .enumerate()
        .map(|(index, start)| {
            let end = labels.get(index + 1).copied().unwrap_or(close);
            let Some(colon) = map.next_code_byte(*start, b':').filter(|c| *c < end) else {
                return instruction(index, None, BodyShape::default());
            };
            let header = &code[*start..colon];
            let label = header.strip_prefix("case").map(literal_text);
            let body = &masked[colon + 1..end];
            instruction(index, label, patterns.as_ref().map(|p| p.shape(body)).unwrap_or_default())
        })
        .collect()
}

struct LexicalPatterns {
    push: Regex,
    indexed: Regex,
    assign: Regex,
    arithmetic: Regex,
    control: Regex,
    breaks: Regex,
    call: Regex,
}

impl LexicalPatterns {
    fn compile() -> Option<Self> {
        Some(Self {
            push: Regex::new(r"\.push\s*\(").ok()?,
            indexed: Regex::new(r"[\w$\])]\s*\[").ok()?,
            assign: Regex::new(r"(?:^|[^=!<>+\-*/%&|^])=(?:[^=]|$)").ok()?,
            arithmetic: Regex::new(
                r"[\w$\])]\s*(?:[+\-*/%^&|]|<<|>>>?)\s*[\w$(\[]|[+\-*/%^&|]=",
            )
            .ok()?,
            control: Regex::new(r"\b(?:continue|if|while|return)\b").ok()?,
            breaks: Regex::new(r"\bbreak\b").ok()?,
            call: Regex::new(r"[\w$\])]\s*\(").ok()?,
        })
    }

    fn shape(&self, body: &str) -> BodyShape {
        let without_push = self.push.replace_all(body, " (");
        let keywordless = self.control.replace_all(&without_push, " ");
        let keywordless = self.breaks.replace_all(&keywordless, " ");
        BodyShape {
            pushes: self.push.is_match(body),
            indexed_read: self.indexed.is_match(body),
            assigns: self.assign.is_match(body),
            arithmetic: self.arithmetic.is_match(body),
            control: self.control.is_match(body),
            breaks: self.breaks.is_match(body),
            calls: self.call.is_match(&keywordless),
        }
    }
}

#[cfg(feature = "js-ast")]
mod ast_extract {
    use std::ops::ControlFlow;

    use boa_ast::expression::access::PropertyAccess;
    use boa_ast::expression::operator::assign::AssignOp;
    use boa_ast::expression::operator::binary::BinaryOp;
    use boa_ast::expression::operator::{Assign, Binary};
    use boa_ast::expression::Call;
    use boa_ast::statement::{Break, Continue, If, Return, Switch, WhileLoop};
    use boa_ast::visitor::{VisitWith, Visitor};
    use boa_interner::{Interner, ToInternedString};

    use super::{instruction, BodyShape};
    use crate::ast::parse_script;
    use crate::lexical::literal_text;
    use crate::types::VmInstruction;

    struct ShapeVisitor<'a> {
        interner: &'a Interner,
        shape: BodyShape,
    }

    impl<'ast, 'a> Visitor<'ast> for ShapeVisitor<'a> {
        type BreakTy = ();

        fn visit_call(&mut self, node: &'ast Call) -> ControlFlow<Self::BreakTy> {
            let name = node.function().to_interned_string(self.interner);
            if name.ends_with(".push") {
                self.shape.pushes = true;
            } else {
                self.shape.calls = true;
            }
            node.visit_with(self)
        }

        fn visit_property_access(
            &mut self,
            node: &'ast PropertyAccess,
        ) -> ControlFlow<Self::BreakTy> {
            if node.to_interned_string(self.interner).trim_end().ends_with(']') {
                self.shape.indexed_read = true;
            }
            node.visit_with(self)
        }

        fn visit_assign(&mut self, node: &'ast Assign) -> ControlFlow<Self::BreakTy> {
            self.shape.assigns = true;
            if !matches!(node.op(), AssignOp::Assign) {
                self.shape.arithmetic = true;
            }
            node.visit_with(self)
        }

        fn visit_binary(&mut self, node: &'ast Binary) -> ControlFlow<Self::BreakTy> {
            if matches!(node.op(), BinaryOp::Arithmetic(_) | BinaryOp::Bitwise(_)) {
                self.shape.arithmetic = true;
            }
            node.visit_with(self)
        }

        fn visit_break(&mut self, node: &'ast Break) -> ControlFlow<Self::BreakTy> {
            self.shape.breaks = true;
            node.visit_with(self)
        }

        fn visit_continue(&mut self, node: &'ast Continue) -> ControlFlow<Self::BreakTy> {
            self.shape.control = true;
            node.visit_with(self)
        }

        fn visit_if(&mut self, node: &'ast If) -> ControlFlow<Self::BreakTy> {
            self.shape.control = true;
            node.visit_with(self)
        }

        fn visit_while_loop(&mut self, node: &'ast WhileLoop) -> ControlFlow<Self::BreakTy> {
            self.shape.control = true;
            node.visit_with(self)
        }

        fn visit_return(&mut self, node: &'ast Return) -> ControlFlow<Self::BreakTy> {
            self.shape.control = true;
            node.visit_with(self)
        }
    }

    struct InterpreterFinder<'a> {
        interner: &'a Interner,
        expected: usize,
        found: Option<Vec<VmInstruction>>,
    }

    impl<'ast, 'a> Visitor<'ast> for InterpreterFinder<'a> {
        type BreakTy = ();

        fn visit_switch(&mut self, node: &'ast Switch) -> ControlFlow<Self::BreakTy> {
            if node.cases().len() != self.expected {
                return node.visit_with(self);
            }
            let instructions = node
                .cases()
                .iter()
                .enumerate()
                .map(|(index, case)| {
                    let label = case
                        .condition()
                        .map(|cond| literal_text(&cond.to_interned_string(self.interner)));
                    let mut shape =
                        ShapeVisitor { interner: self.interner, shape: BodyShape::default() };
                    let _ = case.body().visit_with(&mut shape);
                    instruction(index, label, shape.shape)
                })
                .collect();
            self.found = Some(instructions);
            ControlFlow::Break(())
        }
    }

    pub(super) fn extract(code: &str, expected: usize) -> Option<Vec<VmInstruction>> {
        let parsed = parse_script(code)?;
        let mut finder = InterpreterFinder { interner: &parsed.interner, expected, found: None };
        let _ = parsed.script.visit_with(&mut finder);
        Some(finder.found.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::detect;

    const VM: &str = r#"
var code = [1, 2, 3, 4];
var pc = 0, stack = [], mem = {};
for (;;) {
  switch (code[pc++]) {
    case 0: stack.push(code[pc++]); break;
    case 1: mem.x = stack[0]; break;
    case 2: stack.push(stack.pop() + stack.pop()); break;
    case 3: if (stack.pop()) { pc = 0; } break;
    case 4: stack.push(fn.apply(null, stack)); break;
    case 5: break;
    case 6: stack.push(code[pc]); break;
    case 7: r = a; break;
    case 8: a ^= b; break;
    case 9: return stack;
    case 10: log('x'); break;
  }
}
"#;

    fn features(count: usize) -> VmFeatures {
        VmFeatures {
            instruction_count: count,
            interpreter_location: None,
            complexity: crate::types::Complexity::Low,
            has_switch: true,
            has_instruction_array: false,
            has_program_counter: true,
        }
    }

    fn kinds(instructions: &[VmInstruction]) -> Vec<InstructionKind> {
        instructions.iter().map(|i| i.kind).collect()
    }

    #[test]
    fn classifies_case_bodies() {
        let wrapped = format!("function run(fn, log, r, a, b) {{ {} }}", VM);
        let instructions = extract_instructions(&wrapped, &features(11));
        assert_eq!(instructions.len(), 11);
        assert_eq!(instructions[0].opcode, Opcode::Number(0.0));
        assert_eq!(instructions[0].name, "op_0");
        use InstructionKind::*;
        assert_eq!(
            kinds(&instructions),
            vec![
                Load, Store, Arithmetic, Control, Call, Control, Load, Store, Arithmetic, Control,
                Call,
            ]
        );
    }

    #[test]
    fn lexical_extraction_agrees() {
        let instructions = regex_extract(VM, 11);
        use InstructionKind::*;
        assert_eq!(
            kinds(&instructions),
            vec![
                Load, Store, Arithmetic, Control, Call, Control, Load, Store, Arithmetic, Control,
                Call,
            ]
        );
        assert_eq!(instructions[10].opcode, Opcode::Number(10.0));
    }

    #[test]
    fn case_terminating_break_does_not_hide_calls() {
        let mut src = String::from("while (true) { switch (op) {");
        for i in 0..9 {
            src.push_str(&format!("case {}: log(x); break;", i));
        }
        src.push_str("case 9: break; case 10: if (a) { log(x); } break; } }");
        use InstructionKind::*;
        let expected = vec![Call, Call, Call, Call, Call, Call, Call, Call, Call, Control, Control];
        assert_eq!(kinds(&extract_instructions(&src, &features(11))), expected);
        assert_eq!(kinds(&regex_extract(&src, 11)), expected);
    }

    #[test]
    fn mismatched_count_yields_nothing() {
        assert!(extract_instructions(VM, &features(42)).is_empty());
    }

    #[test]
    fn string_labels_become_text_opcodes() {
        let mut src = String::from("while (true) { switch (op) {");
        for i in 0..11 {
            src.push_str(&format!("case 'k{}': s.push(t[i]); break;", i));
        }
        src.push_str("} }");
        let instructions = extract_instructions(&src, &features(11));
        assert_eq!(instructions[3].opcode, Opcode::Text("k3".into()));
        assert_eq!(instructions[3].kind, InstructionKind::Load);
    }

    #[test]
    fn detected_vm_round_trips_into_instructions() {
        let mut src = String::from("var bc = [");
        src.push_str(&vec!["0"; 60].join(","));
        src.push_str("]; var ip = 0; while (1) { switch (bc[ip++]) {");
        for i in 0..12 {
            src.push_str(&format!("case {}: s.push(bc[ip++]); break;", i));
        }
        src.push_str("} }");
        let features = detect(&src).unwrap();
        let instructions = extract_instructions(&src, &features);
        assert_eq!(instructions.len(), features.instruction_count);
    }
}
