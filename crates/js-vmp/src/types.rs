use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

/// 1-based line/column of a construct in the analysed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let before = &source.as_bytes()[..offset];
        let line = before.iter().filter(|b| **b == b'\n').count() + 1;
        let line_start = before.iter().rposition(|b| *b == b'\n').map(|p| p + 1).unwrap_or(0);
        Self { line, column: offset - line_start + 1 }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFeatures {
    pub instruction_count: usize,
    pub interpreter_location: Option<SourceLocation>,
    pub complexity: Complexity,
    pub has_switch: bool,
    pub has_instruction_array: bool,
    pub has_program_counter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    Load,
    Store,
    Arithmetic,
    Control,
    Call,
    Unknown,
}

impl InstructionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstructionKind::Load => "load",
            InstructionKind::Store => "store",
            InstructionKind::Arithmetic => "arithmetic",
            InstructionKind::Control => "control",
            InstructionKind::Call => "call",
            InstructionKind::Unknown => "unknown",
        }
    }
}

/// Case label of an interpreter branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Opcode {
    Number(f64),
    Text(String),
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Number(n) => write!(f, "{}", format_number(*n)),
            Opcode::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Number(f64),
    Text(String),
}

impl Operand {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Operand::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as usize),
            Operand::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Number(n) => write!(f, "{}", format_number(*n)),
            Operand::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInstruction {
    pub opcode: Opcode,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InstructionKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<Operand>,
}

impl VmInstruction {
    /// Builds an instruction for direct symbolic replay, e.g. `("PUSH", [1])`.
    pub fn op(name: &str, operands: Vec<Operand>) -> Self {
        Self {
            opcode: Opcode::Text(name.to_string()),
            name: name.to_string(),
            kind: InstructionKind::Unknown,
            description: String::new(),
            operands,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmType {
    #[serde(rename = "obfuscator.io")]
    ObfuscatorIo,
    #[serde(rename = "jsfuck")]
    JsFuck,
    #[serde(rename = "jjencode")]
    JjEncode,
    #[serde(rename = "custom")]
    Custom,
}

impl VmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::ObfuscatorIo => "obfuscator.io",
            VmType::JsFuck => "jsfuck",
            VmType::JjEncode => "jjencode",
            VmType::Custom => "custom",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedPart {
    pub location: String,
    pub reason: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub code: String,
    pub confidence: f64,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_parts: Vec<UnresolvedPart>,
}

impl RestoreResult {
    pub fn new(code: impl Into<String>, confidence: f64) -> Self {
        Self {
            code: code.into(),
            confidence: clamp_confidence(confidence),
            warnings: Vec::new(),
            unresolved_parts: Vec::new(),
        }
    }

    /// Original code at low confidence with one explanatory warning.
    pub fn fallback(original: &str, confidence: f64, warning: impl Into<String>) -> Self {
        let mut result = Self::new(original, confidence);
        result.warnings.push(warning.into());
        result
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn raise(&mut self, amount: f64) {
        self.confidence = clamp_confidence(self.confidence + amount);
    }

    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_confidence(confidence);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeobfuscateOptions {
    pub aggressive: bool,
    pub extract_instructions: bool,
    pub timeout_ms: u64,
    pub max_iterations: usize,
}

impl Default for DeobfuscateOptions {
    fn default() -> Self {
        Self { aggressive: false, extract_instructions: true, timeout_ms: 5_000, max_iterations: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreStats {
    pub original_size: usize,
    pub restored_size: usize,
    pub reduction_rate: f64,
    pub processing_time_ms: u64,
}

impl RestoreStats {
    pub fn measure(original: &str, restored: &str, processing_time_ms: u64) -> Self {
        let reduction_rate = if original.is_empty() {
            0.0
        } else {
            1.0 - restored.len() as f64 / original.len() as f64
        };
        Self {
            original_size: original.len(),
            restored_size: restored.len(),
            reduction_rate,
            processing_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicSummary {
    pub inferred_logic: String,
    pub steps: usize,
    pub confidence: f64,
    pub constraint_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeobfuscateResult {
    pub is_jsvmp: bool,
    pub vm_type: Option<VmType>,
    pub vm_features: Option<VmFeatures>,
    pub instructions: Vec<VmInstruction>,
    pub deobfuscated_code: String,
    pub confidence: f64,
    pub warnings: Vec<String>,
    pub unresolved_parts: Vec<UnresolvedPart>,
    pub symbolic: Option<SymbolicSummary>,
    pub stats: RestoreStats,
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        let mut result = RestoreResult::new("x", 1.7);
        assert_eq!(result.confidence, 1.0);
        result.set_confidence(-0.5);
        assert_eq!(result.confidence, 0.0);
        result.raise(f64::NAN);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn location_from_offset() {
        let src = "var a;\n  switch (x) {}";
        let offset = src.find("switch").unwrap();
        assert_eq!(SourceLocation::from_offset(src, offset), SourceLocation { line: 2, column: 3 });
    }

    #[test]
    fn reduction_rate_handles_empty_input() {
        assert_eq!(RestoreStats::measure("", "", 0).reduction_rate, 0.0);
        let stats = RestoreStats::measure("abcd", "ab", 3);
        assert!((stats.reduction_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn vm_type_serializes_with_family_names() {
        assert_eq!(serde_json::to_string(&VmType::ObfuscatorIo).unwrap(), "\"obfuscator.io\"");
        assert_eq!(VmType::JjEncode.to_string(), "jjencode");
    }
}
