//! Recognition of VM-interpreter shaped JavaScript.
//!
//! The AST path walks `switch`, array literal, update, call and loop nodes.
//! When the source does not parse, the same signals are recovered from the
//! masked source text with regular expressions.

use regex::Regex;
use tracing::{debug, instrument, trace};

use crate::config::DetectorConfig;
use crate::lexical::CodeMap;
use crate::types::{Complexity, SourceLocation, VmFeatures, VmType};

/// Raw observations behind a [`VmFeatures`] verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmSignals {
    /// Case count of the largest switch statement
    pub max_switch_cases: usize,
    /// Position of that switch among all switch keywords, in source order
    pub switch_ordinal: Option<usize>,
    pub has_switch: bool,
    pub has_instruction_array: bool,
    pub has_program_counter: bool,
    pub has_apply_call: bool,
    pub has_infinite_loop: bool,
    pub has_bytecode_decode: bool,
    pub from_ast: bool,
}

impl VmSignals {
    pub fn is_jsvmp(&self) -> bool {
        self.has_switch
            && (self.has_instruction_array || self.has_program_counter)
            && (self.has_apply_call || self.has_infinite_loop || self.has_bytecode_decode)
    }

    fn note_switch(&mut self, ordinal: usize, cases: usize, config: &DetectorConfig) {
        if cases > config.min_switch_cases {
            self.has_switch = true;
        }
        if cases > self.max_switch_cases {
            self.max_switch_cases = cases;
            self.switch_ordinal = Some(ordinal);
        }
    }
}

pub fn detect(code: &str) -> Option<VmFeatures> {
    detect_with(code, &DetectorConfig::default())
}

#[instrument(skip_all, fields(bytes = code.len()))]
pub fn detect_with(code: &str, config: &DetectorConfig) -> Option<VmFeatures> {
    let signals = scan_signals(code, config)?;
    debug!(?signals, "vm signals");
    if !signals.is_jsvmp() {
        return None;
    }
    let map = CodeMap::new(code);
    let interpreter_location = signals
        .switch_ordinal
        .and_then(|ordinal| map.keyword_offsets("switch").get(ordinal).copied())
        .map(|offset| SourceLocation::from_offset(code, offset));
    Some(VmFeatures {
        instruction_count: signals.max_switch_cases,
        interpreter_location,
        complexity: complexity_for(signals.max_switch_cases, config),
        has_switch: signals.has_switch,
        has_instruction_array: signals.has_instruction_array,
        has_program_counter: signals.has_program_counter,
    })
}

pub fn complexity_for(instruction_count: usize, config: &DetectorConfig) -> Complexity {
    if instruction_count > config.high_complexity {
        Complexity::High
    } else if instruction_count > config.medium_complexity {
        Complexity::Medium
    } else {
        Complexity::Low
    }
}

/// Collects interpreter signals, preferring the AST and falling back to the
/// lexical scan when parsing fails.
pub fn scan_signals(code: &str, config: &DetectorConfig) -> Option<VmSignals> {
    #[cfg(feature = "js-ast")]
    {
        if let Some(signals) = ast_scan::scan(code, config) {
            return Some(signals);
        }
    }
    regex_scan(code, config)
}

pub fn identify_vm_type(code: &str, features: &VmFeatures) -> VmType {
    trace!(instructions = features.instruction_count, "identifying vm family");
    classify_family(code)
}

pub(crate) fn classify_family(code: &str) -> VmType {
    let trimmed = code.trim_start();
    let hex_ident = Regex::new(r"_0x[0-9a-fA-F]{4,}").ok();
    let hex_wrapper = Regex::new(r"function\s*[\w$]*\s*\(\s*_0x[0-9a-fA-F]+").ok();
    if let (Some(ident), Some(wrapper)) = (hex_ident, hex_wrapper) {
        if ident.is_match(code) && wrapper.is_match(code) {
            return VmType::ObfuscatorIo;
        }
    }
    if looks_like_jsfuck(trimmed) {
        return VmType::JsFuck;
    }
    if let Ok(prefix) = Regex::new(r"^([A-Za-z_$][\w$]*)\s*=\s*~\s*\[\s*\]\s*;") {
        if prefix.is_match(trimmed) {
            return VmType::JjEncode;
        }
    }
    VmType::Custom
}

fn looks_like_jsfuck(trimmed: &str) -> bool {
    const MIN_PREFIX: usize = 20;
    let is_fuck = |c: char| matches!(c, '[' | ']' | '(' | ')' | '!' | '+');
    let significant = trimmed.trim_end().trim_end_matches(';');
    if significant.is_empty() || !significant.starts_with(['[', '(', '!', '+']) {
        return false;
    }
    let prefix = significant.chars().take_while(|c| is_fuck(*c) || c.is_whitespace()).count();
    prefix >= MIN_PREFIX.min(significant.chars().count())
}

pub(crate) fn regex_scan(code: &str, config: &DetectorConfig) -> Option<VmSignals> {
    let map = CodeMap::new(code);
    let masked = map.masked();
    let mut signals = VmSignals::default();

    for (ordinal, offset) in map.keyword_offsets("switch").into_iter().enumerate() {
        let cases = switch_case_offsets(&map, offset).map(|c| c.len()).unwrap_or(0);
        signals.note_switch(ordinal, cases, config);
    }

    if let Ok(array) = Regex::new(r"\[([^\[\]]*)\]") {
        signals.has_instruction_array = array.captures_iter(&masked).any(|caps| {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            !body.trim().is_empty() && body.matches(',').count() + 1 > config.min_array_elements
        });
    }

    let tail = config.max_counter_name_len.saturating_sub(1);
    let counter = format!(
        concat!(
            r"(?:^|[^\w$.])[A-Za-z_$][\w$]{{0,{tail}}}\s*(?:\+\+|--)",
            r"|(?:\+\+|--)\s*[A-Za-z_$][\w$]{{0,{tail}}}(?:[^\w$]|$)",
        ),
        tail = tail
    );
    if let Ok(counter) = Regex::new(&counter) {
        signals.has_program_counter = counter.is_match(&masked);
    }
    if let Ok(apply) = Regex::new(r"\.apply\s*\(") {
        signals.has_apply_call = apply.is_match(&masked);
    }
    if let Ok(looping) =
        Regex::new(r"while\s*\(\s*(?:true|1|!0|!!\[\])\s*\)|for\s*\(\s*;\s*;\s*\)")
    {
        signals.has_infinite_loop = looping.is_match(&masked);
    }
    if let Ok(decode) = Regex::new(r"parseInt\s*\(\s*[^,()]*\+") {
        signals.has_bytecode_decode = decode.is_match(&masked);
    }
    Some(signals)
}

/// Offsets of the `case`/`default` labels directly inside the switch whose
/// keyword starts at `switch_offset`, plus the offset of its closing brace.
pub(crate) fn switch_case_offsets(map: &CodeMap<'_>, switch_offset: usize) -> Option<Vec<usize>> {
    switch_body(map, switch_offset).map(|(labels, _)| labels)
}

pub(crate) fn switch_body(map: &CodeMap<'_>, switch_offset: usize) -> Option<(Vec<usize>, usize)> {
    let paren = map.next_code_byte(switch_offset, b'(')?;
    let paren_close = map.matching_close(paren)?;
    let open = map.next_code_byte(paren_close, b'{')?;
    let close = map.matching_close(open)?;
    let bytes = map.src().as_bytes();
    let mut labels: Vec<usize> = map
        .keyword_offsets("case")
        .into_iter()
        .chain(map.keyword_offsets("default"))
        .filter(|offset| *offset > open && *offset < close)
        .filter(|offset| brace_depth(map, bytes, open, *offset) == 1)
        .collect();
    labels.sort_unstable();
    Some((labels, close))
}

fn brace_depth(map: &CodeMap<'_>, bytes: &[u8], from: usize, to: usize) -> usize {
    let mut depth = 0isize;
    for offset in from..to {
        if !map.is_code(offset) {
            continue;
        }
        match bytes[offset] {
            b'{' => depth += 1,
            b'}' => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

#[cfg(feature = "js-ast")]
mod ast_scan {
    use std::ops::ControlFlow;

    use boa_ast::expression::literal::ArrayLiteral;
    use boa_ast::expression::operator::binary::{ArithmeticOp, BinaryOp};
    use boa_ast::expression::operator::Update;
    use boa_ast::expression::{Call, Expression};
    use boa_ast::statement::{DoWhileLoop, ForLoop, Switch, WhileLoop};
    use boa_ast::visitor::{VisitWith, Visitor};
    use boa_interner::{Interner, ToInternedString};

    use super::VmSignals;
    use crate::ast::parse_script;
    use crate::config::DetectorConfig;

    struct SignalVisitor<'a> {
        interner: &'a Interner,
        config: &'a DetectorConfig,
        switches_seen: usize,
        signals: VmSignals,
    }

    impl<'ast, 'a> Visitor<'ast> for SignalVisitor<'a> {
        type BreakTy = ();

        fn visit_switch(&mut self, node: &'ast Switch) -> ControlFlow<Self::BreakTy> {
            let ordinal = self.switches_seen;
            self.switches_seen += 1;
            self.signals.note_switch(ordinal, node.cases().len(), self.config);
            node.visit_with(self)
        }

        fn visit_array_literal(&mut self, node: &'ast ArrayLiteral) -> ControlFlow<Self::BreakTy> {
            if node.as_ref().len() > self.config.min_array_elements {
                self.signals.has_instruction_array = true;
            }
            node.visit_with(self)
        }

        fn visit_update(&mut self, node: &'ast Update) -> ControlFlow<Self::BreakTy> {
            let rendered = node.to_interned_string(self.interner);
            let target = rendered.trim_matches(|c: char| c == '+' || c == '-' || c.is_whitespace());
            let is_ident = !target.is_empty()
                && target.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$');
            if is_ident && target.chars().count() <= self.config.max_counter_name_len {
                self.signals.has_program_counter = true;
            }
            node.visit_with(self)
        }

        fn visit_call(&mut self, node: &'ast Call) -> ControlFlow<Self::BreakTy> {
            let name = node.function().to_interned_string(self.interner);
            if name == "parseInt" || name.ends_with(".parseInt") {
                let concatenated = matches!(
                    node.args().first(),
                    Some(Expression::Binary(binary))
                        if matches!(binary.op(), BinaryOp::Arithmetic(ArithmeticOp::Add))
                );
                if concatenated {
                    self.signals.has_bytecode_decode = true;
                }
            }
            if name.ends_with(".apply") {
                self.signals.has_apply_call = true;
            }
            node.visit_with(self)
        }

        fn visit_while_loop(&mut self, node: &'ast WhileLoop) -> ControlFlow<Self::BreakTy> {
            if is_constant_truthy(&node.condition().to_interned_string(self.interner)) {
                self.signals.has_infinite_loop = true;
            }
            node.visit_with(self)
        }

        fn visit_do_while_loop(&mut self, node: &'ast DoWhileLoop) -> ControlFlow<Self::BreakTy> {
            if is_constant_truthy(&node.cond().to_interned_string(self.interner)) {
                self.signals.has_infinite_loop = true;
            }
            node.visit_with(self)
        }

        fn visit_for_loop(&mut self, node: &'ast ForLoop) -> ControlFlow<Self::BreakTy> {
            let infinite = match node.condition() {
                None => true,
                Some(cond) => is_constant_truthy(&cond.to_interned_string(self.interner)),
            };
            if infinite {
                self.signals.has_infinite_loop = true;
            }
            node.visit_with(self)
        }
    }

    fn is_constant_truthy(rendered: &str) -> bool {
        matches!(rendered.trim(), "true" | "1" | "!0" | "!![]" | "!!1")
    }

    pub(super) fn scan(code: &str, config: &DetectorConfig) -> Option<VmSignals> {
        let parsed = parse_script(code)?;
        let mut visitor = SignalVisitor {
            interner: &parsed.interner,
            config,
            switches_seen: 0,
            signals: VmSignals { from_ast: true, ..VmSignals::default() },
        };
        let _ = parsed.script.visit_with(&mut visitor);
        Some(visitor.signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_sample(cases: usize) -> String {
        let mut src = String::from("var bc = [");
        src.push_str(&(0..60).map(|i| i.to_string()).collect::<Vec<_>>().join(","));
        src.push_str("];\nvar pc = 0, st = [];\nwhile (true) {\n  switch (bc[pc++]) {\n");
        for i in 0..cases {
            src.push_str(&format!("    case {}: st.push(bc[pc]); break;\n", i));
        }
        src.push_str("  }\n}\n");
        src
    }

    #[test]
    fn detects_interpreter_loop() {
        let features = detect(&vm_sample(12)).expect("vm detected");
        assert_eq!(features.instruction_count, 12);
        assert!(features.has_switch);
        assert!(features.has_instruction_array && features.has_program_counter);
        assert_eq!(features.complexity, Complexity::Low);
        assert_eq!(features.interpreter_location.map(|l| l.line), Some(4));
    }

    #[test]
    fn complexity_tiers() {
        let config = DetectorConfig::default();
        assert_eq!(complexity_for(101, &config), Complexity::High);
        assert_eq!(complexity_for(100, &config), Complexity::Medium);
        assert_eq!(complexity_for(51, &config), Complexity::Medium);
        assert_eq!(complexity_for(50, &config), Complexity::Low);
    }

    #[test]
    fn plain_code_is_not_a_vm() {
        assert!(detect("function add(a, b) { return a + b; }").is_none());
    }

    #[test]
    fn switch_without_loop_signal_is_not_a_vm() {
        let src = vm_sample(12).replace("while (true)", "if (ok)");
        assert!(detect(&src).is_none());
    }

    #[test]
    fn regex_scan_matches_ast_scan() {
        let src = vm_sample(15);
        let config = DetectorConfig::default();
        let lexical = regex_scan(&src, &config).unwrap();
        assert!(lexical.is_jsvmp());
        assert_eq!(lexical.max_switch_cases, 15);
        assert_eq!(lexical.switch_ordinal, Some(0));
    }

    #[test]
    fn malformed_source_uses_lexical_fallback() {
        let broken = format!("{} )))", vm_sample(11));
        let signals = scan_signals(&broken, &DetectorConfig::default()).unwrap();
        assert!(!signals.from_ast);
        assert!(detect(&broken).is_some());
    }

    #[test]
    fn family_signatures() {
        assert_eq!(
            classify_family("var _0x1a2b3c=['a'];(function(_0x4d5e){})(_0x1a2b3c);"),
            VmType::ObfuscatorIo
        );
        assert_eq!(classify_family("[][(![]+[])[+[]]+(![]+[])[!+[]+!+[]]]"), VmType::JsFuck);
        assert_eq!(classify_family("$=~[];$={___:++$};"), VmType::JjEncode);
        assert_eq!(classify_family("var a = 1;"), VmType::Custom);
    }
}
