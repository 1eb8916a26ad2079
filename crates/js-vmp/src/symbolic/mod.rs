//! Single-path abstract interpreter for extracted VM bytecode.
//!
//! Values are expressions: arithmetic builds new names such as `a + b`
//! instead of computing results. Execution follows exactly the jump targets
//! in the instruction stream; branches are recorded as path constraints
//! but never forked.

mod opcode;
mod state;

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::config::SymbolicConfig;
use crate::types::{Operand, VmInstruction};

pub use opcode::Mnemonic;
use opcode::Step;
pub use state::{Constraint, ConstraintKind, SymbolicState, SymbolicValue, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The program counter left the instruction list
    OutOfRange,
    Halted,
    StepBudget,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub final_state: SymbolicState,
    /// State before each executed instruction, in execution order
    pub execution_trace: Vec<SymbolicState>,
    pub inferred_logic: String,
    pub constraints: Vec<Constraint>,
    pub confidence: f64,
    pub warnings: Vec<String>,
    pub termination: Termination,
}

enum Outcome {
    Next(SymbolicState),
    Halt(SymbolicState),
}

/// Replays `instructions` with at most `max_steps` steps (further capped at
/// the instruction count) and a wall-clock budget of `timeout_ms`.
pub fn execute_jsvmp(
    instructions: &[VmInstruction],
    max_steps: usize,
    timeout_ms: u64,
) -> ExecutionResult {
    let config = SymbolicConfig { max_steps, timeout_ms, ..SymbolicConfig::default() };
    execute_with(instructions, &config)
}

#[instrument(skip_all, fields(instructions = instructions.len(), max_steps = config.max_steps))]
pub fn execute_with(instructions: &[VmInstruction], config: &SymbolicConfig) -> ExecutionResult {
    let mut executor = Executor {
        instructions,
        warnings: Vec::new(),
        fallback_names: BTreeSet::new(),
        underflows: 0,
    };
    let budget = config.max_steps.min(instructions.len());
    let timeout = Duration::from_millis(config.timeout_ms);
    let started = Instant::now();

    let mut state = SymbolicState::new();
    let mut execution_trace = Vec::new();
    let termination = loop {
        if state.pc >= instructions.len() {
            break Termination::OutOfRange;
        }
        if execution_trace.len() >= budget {
            if budget < instructions.len() {
                executor
                    .warnings
                    .push(format!("step budget of {} exhausted at pc {}", budget, state.pc));
            }
            break Termination::StepBudget;
        }
        if started.elapsed() >= timeout {
            executor.warnings.push(format!(
                "symbolic execution timed out after {} ms and {} steps",
                config.timeout_ms,
                execution_trace.len()
            ));
            break Termination::Timeout;
        }
        let Some(instruction) = instructions.get(state.pc) else {
            break Termination::OutOfRange;
        };
        execution_trace.push(state.clone());
        match executor.apply(&state, instruction) {
            Outcome::Next(next) => state = next,
            Outcome::Halt(next) => {
                state = next;
                break Termination::Halted;
            }
        }
    };

    let inferred_logic =
        infer_logic(instructions, &execution_trace, &state, config.logic_preview_lines);
    let constraints = collect_all_constraints(&execution_trace, &state);
    let confidence = calculate_confidence(execution_trace.len(), instructions.len());
    debug!(steps = execution_trace.len(), ?termination, confidence, "symbolic execution finished");
    ExecutionResult {
        final_state: state,
        execution_trace,
        inferred_logic,
        constraints,
        confidence,
        warnings: executor.warnings,
        termination,
    }
}

/// Coverage of the instruction list, not a measure of correctness.
pub fn calculate_confidence(steps: usize, instruction_count: usize) -> f64 {
    if instruction_count == 0 {
        return 0.0;
    }
    (steps as f64 / instruction_count as f64).min(1.0)
}

struct Executor<'a> {
    instructions: &'a [VmInstruction],
    warnings: Vec<String>,
    fallback_names: BTreeSet<String>,
    /// Placeholders synthesized so far; keeps their names distinct
    underflows: usize,
}

impl<'a> Executor<'a> {
    fn apply(&mut self, current: &SymbolicState, instruction: &VmInstruction) -> Outcome {
        let mut next = current.clone();
        let pc = current.pc;
        let (step, exact) = Step::resolve(instruction);
        if !exact && self.fallback_names.insert(instruction.name.clone()) {
            self.warnings.push(format!(
                "unrecognised mnemonic '{}' replayed from its {} category",
                instruction.name,
                instruction.kind.as_str()
            ));
        }
        trace!(pc, name = %instruction.name, "step");

        let mut jump = None;
        match step {
            Step::OpaqueBinary => {
                let rhs = self.pop(&mut next, pc);
                let lhs = self.pop(&mut next, pc);
                next.stack.push(SymbolicValue::binary(&lhs, &instruction.name, &rhs));
            }
            Step::Known(mnemonic) => match mnemonic {
                Mnemonic::Push | Mnemonic::LoadConst => {
                    let value = instruction
                        .operands
                        .first()
                        .cloned()
                        .map(SymbolicValue::constant)
                        .unwrap_or_else(|| SymbolicValue::placeholder(format!("imm_{}", pc)));
                    next.stack.push(value);
                }
                Mnemonic::Pop => {
                    let _ = self.pop(&mut next, pc);
                }
                Mnemonic::Dup => {
                    let top = self.pop(&mut next, pc);
                    next.stack.push(top.clone());
                    next.stack.push(top);
                }
                Mnemonic::Not => {
                    let operand = self.pop(&mut next, pc);
                    next.stack.push(SymbolicValue::unary("!", &operand));
                }
                Mnemonic::Jmp => jump = self.target(instruction, pc),
                Mnemonic::Jz | Mnemonic::Jnz => {
                    let condition = self.pop(&mut next, pc);
                    let (kind, relation) = if mnemonic == Mnemonic::Jz {
                        (ConstraintKind::Equality, "==")
                    } else {
                        (ConstraintKind::Inequality, "!=")
                    };
                    jump = self.target(instruction, pc);
                    next.path_constraints.push(Constraint {
                        kind,
                        expression: format!("{} {} 0", condition.operand_text(), relation),
                        description: format!("branch taken at pc {}", pc),
                    });
                }
                Mnemonic::Call => {
                    debug!(pc, target = %operand_name(instruction), "call recorded, not followed");
                }
                Mnemonic::Load => {
                    let name = operand_name(instruction);
                    let value = next.memory.get(&name).cloned().unwrap_or_else(|| SymbolicValue {
                        kind: ValueKind::Memory,
                        ..SymbolicValue::placeholder(name.clone())
                    });
                    next.stack.push(value);
                }
                Mnemonic::Store => {
                    let name = operand_name(instruction);
                    let mut value = self.pop(&mut next, pc);
                    value.constraints.push(Constraint {
                        kind: ConstraintKind::Assignment,
                        expression: format!("{} = {}", name, value.name),
                        description: format!("stored at pc {}", pc),
                    });
                    next.memory.insert(name, value);
                }
                Mnemonic::Halt => return Outcome::Halt(next),
                Mnemonic::Ret | Mnemonic::Nop => {}
                binary => {
                    let op = binary.operator().unwrap_or(binary.as_str());
                    let rhs = self.pop(&mut next, pc);
                    let lhs = self.pop(&mut next, pc);
                    next.stack.push(SymbolicValue::binary(&lhs, op, &rhs));
                }
            },
        }
        next.pc = jump.unwrap_or(pc + 1);
        Outcome::Next(next)
    }

    fn pop(&mut self, state: &mut SymbolicState, pc: usize) -> SymbolicValue {
        match state.stack.pop() {
            Some(value) => value,
            None => {
                self.warnings.push(format!("stack underflow at pc {}", pc));
                let name = format!("underflow_{}_{}", pc, self.underflows);
                self.underflows += 1;
                SymbolicValue::placeholder(name)
            }
        }
    }

    fn target(&mut self, instruction: &VmInstruction, pc: usize) -> Option<usize> {
        let Some(target) = instruction.operands.first().and_then(Operand::as_index) else {
            self.warnings.push(format!("{} at pc {} has no usable target", instruction.name, pc));
            return None;
        };
        if target >= self.instructions.len() {
            self.warnings
                .push(format!("jump target {} at pc {} is outside the program", target, pc));
        }
        Some(target)
    }
}

fn operand_name(instruction: &VmInstruction) -> String {
    instruction
        .operands
        .first()
        .map(Operand::as_name)
        .unwrap_or_else(|| instruction.name.clone())
}

/// Readable listing of the first `limit` executed instructions with the
/// effect each one had on the state that followed it.
pub fn infer_logic(
    instructions: &[VmInstruction],
    trace: &[SymbolicState],
    final_state: &SymbolicState,
    limit: usize,
) -> String {
    let mut lines = Vec::new();
    for (index, before) in trace.iter().take(limit).enumerate() {
        let Some(instruction) = instructions.get(before.pc) else { continue };
        let after = trace.get(index + 1).unwrap_or(final_state);
        let operands = instruction
            .operands
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let mut line = format!("{:04} {}", before.pc, instruction.name);
        if !operands.is_empty() {
            line.push(' ');
            line.push_str(&operands);
        }
        if let Some(effect) = effect_of(instruction, before, after) {
            line.push_str("  ; ");
            line.push_str(&effect);
        }
        lines.push(line);
    }
    if trace.len() > limit {
        lines.push(format!("... {} more steps", trace.len() - limit));
    }
    lines.join("\n")
}

fn effect_of(
    instruction: &VmInstruction,
    before: &SymbolicState,
    after: &SymbolicState,
) -> Option<String> {
    let (step, _) = Step::resolve(instruction);
    let mnemonic = match step {
        Step::OpaqueBinary => return after.stack.last().map(|v| format!("=> {}", v)),
        Step::Known(m) => m,
    };
    match mnemonic {
        Mnemonic::Store => {
            let name = operand_name(instruction);
            after.memory.get(&name).map(|v| format!("{} = {}", name, v))
        }
        Mnemonic::Jmp => Some(format!("goto {}", after.pc)),
        Mnemonic::Jz | Mnemonic::Jnz => after
            .path_constraints
            .last()
            .map(|c| format!("if {} goto {}", c.expression, after.pc)),
        Mnemonic::Call => Some(format!("call {} (not followed)", operand_name(instruction))),
        Mnemonic::Halt => Some("halt".into()),
        Mnemonic::Pop | Mnemonic::Ret | Mnemonic::Nop => None,
        _ if after.stack.is_empty() && before.stack.is_empty() => None,
        _ => after.stack.last().map(|v| format!("=> {}", v)),
    }
}

/// Path constraints and per-value constraints across every snapshot,
/// deduplicated in first-seen order.
pub fn collect_all_constraints(
    trace: &[SymbolicState],
    final_state: &SymbolicState,
) -> Vec<Constraint> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for state in trace.iter().chain(std::iter::once(final_state)) {
        let values =
            state.stack.iter().chain(state.memory.values()).chain(state.registers.values());
        let candidates = state
            .path_constraints
            .iter()
            .chain(values.flat_map(|v| v.constraints.iter()));
        for constraint in candidates {
            if seen.insert(constraint.clone()) {
                out.push(constraint.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str) -> VmInstruction {
        VmInstruction::op(name, Vec::new())
    }

    fn op_n(name: &str, n: f64) -> VmInstruction {
        VmInstruction::op(name, vec![Operand::Number(n)])
    }

    fn op_s(name: &str, s: &str) -> VmInstruction {
        VmInstruction::op(name, vec![Operand::Text(s.into())])
    }

    #[test]
    fn arithmetic_builds_expressions() {
        let program = vec![
            op_n("PUSH", 1.0),
            op_n("PUSH", 2.0),
            op("ADD"),
            op_s("STORE", "x"),
            op("HALT"),
        ];
        let result = execute_jsvmp(&program, 100, 1_000);
        assert_eq!(result.termination, Termination::Halted);
        let x = result.final_state.memory.get("x").unwrap();
        assert_eq!(x.name, "1 + 2");
        assert_eq!(x.kind, ValueKind::Expression);
        assert!(result
            .constraints
            .iter()
            .any(|c| c.kind == ConstraintKind::Definition && c.expression == "1 + 2"));
        assert!(result.constraints.iter().any(|c| c.expression == "x = 1 + 2"));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn push_records_literal_candidate() {
        let result = execute_jsvmp(&[op_n("PUSH", 7.0)], 10, 1_000);
        let top = result.final_state.stack.last().unwrap();
        assert_eq!(top.possible_values, vec![Operand::Number(7.0)]);
        assert_eq!(result.termination, Termination::OutOfRange);
    }

    #[test]
    fn nested_expressions_are_parenthesised() {
        let program = vec![
            op_n("PUSH", 1.0),
            op_n("PUSH", 2.0),
            op("ADD"),
            op_n("PUSH", 3.0),
            op("MUL"),
        ];
        let result = execute_jsvmp(&program, 100, 1_000);
        assert_eq!(result.final_state.stack[0].name, "(1 + 2) * 3");
    }

    #[test]
    fn jumps_follow_targets_without_forking() {
        let program = vec![
            op_s("LOAD", "flag"),
            op_n("JZ", 3.0),
            op_n("PUSH", 99.0),
            op_n("PUSH", 1.0),
            op("HALT"),
        ];
        let result = execute_jsvmp(&program, 100, 1_000);
        let pcs: Vec<usize> = result.execution_trace.iter().map(|s| s.pc).collect();
        assert_eq!(pcs, vec![0, 1, 3, 4]);
        assert_eq!(result.final_state.path_constraints.len(), 1);
        assert_eq!(result.final_state.path_constraints[0].expression, "flag == 0");
        assert_eq!(result.final_state.stack.len(), 1);
    }

    #[test]
    fn trace_snapshots_are_history() {
        let program = vec![op_n("PUSH", 1.0), op_n("PUSH", 2.0), op("POP")];
        let result = execute_jsvmp(&program, 100, 1_000);
        let depths: Vec<usize> = result.execution_trace.iter().map(|s| s.stack.len()).collect();
        assert_eq!(depths, vec![0, 1, 2]);
        assert_eq!(result.final_state.stack.len(), 1);
    }

    #[test]
    fn step_budget_bounds_trace() {
        let program = vec![op("NOP"), op_n("JMP", 0.0)];
        let result = execute_jsvmp(&program, 1_000, 1_000);
        assert_eq!(result.execution_trace.len(), 2);
        assert_eq!(result.termination, Termination::StepBudget);

        let program: Vec<_> = (0..10).map(|_| op("NOP")).collect();
        let result = execute_jsvmp(&program, 4, 1_000);
        assert_eq!(result.execution_trace.len(), 4);
        assert!((result.confidence - 0.4).abs() < 1e-9);
        assert!(result.warnings.iter().any(|w| w.contains("step budget")));
    }

    #[test]
    fn zero_timeout_yields_partial_result() {
        let program: Vec<_> = (0..5).map(|_| op("NOP")).collect();
        let result = execute_jsvmp(&program, 10, 0);
        assert_eq!(result.termination, Termination::Timeout);
        assert!(result.warnings.iter().any(|w| w.contains("timed out")));
        assert!(result.confidence <= 1.0);
    }

    #[test]
    fn underflow_and_missing_targets_warn() {
        let result = execute_jsvmp(&[op("ADD"), op("JMP")], 10, 1_000);
        assert!(result.warnings.iter().any(|w| w.contains("underflow")));
        assert!(result.warnings.iter().any(|w| w.contains("no usable target")));
        assert_eq!(result.final_state.stack[0].name, "underflow_0_1 + underflow_0_0");
    }

    #[test]
    fn call_is_a_no_op() {
        let result = execute_jsvmp(&[op_s("CALL", "decode"), op_n("PUSH", 1.0)], 10, 1_000);
        assert_eq!(result.execution_trace[1].stack.len(), 0);
        assert_eq!(result.execution_trace[1].pc, 1);
        assert!(result.inferred_logic.contains("call decode (not followed)"));
    }

    #[test]
    fn extracted_categories_replay() {
        use crate::types::{InstructionKind, Opcode};
        let lifted = |n: usize, kind| VmInstruction {
            opcode: Opcode::Number(n as f64),
            name: format!("op_{}", n),
            kind,
            description: String::new(),
            operands: Vec::new(),
        };
        let program = vec![
            lifted(0, InstructionKind::Load),
            lifted(1, InstructionKind::Load),
            lifted(2, InstructionKind::Arithmetic),
            lifted(3, InstructionKind::Store),
        ];
        let result = execute_jsvmp(&program, 10, 1_000);
        assert_eq!(result.final_state.memory.get("op_3").unwrap().name, "op_0 op_2 op_1");
        assert_eq!(result.warnings.iter().filter(|w| w.contains("unrecognised")).count(), 4);
    }

    #[test]
    fn logic_listing_is_limited() {
        let program: Vec<_> = (0..12).map(|i| op_n("PUSH", i as f64)).collect();
        let result = execute_jsvmp(&program, 100, 1_000);
        let lines: Vec<&str> = result.inferred_logic.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "0000 PUSH 0  ; => 0");
        assert_eq!(lines[10], "... 2 more steps");
    }

    #[test]
    fn empty_program_has_zero_confidence() {
        let result = execute_jsvmp(&[], 10, 1_000);
        assert_eq!(result.confidence, 0.0);
        assert!(result.execution_trace.is_empty());
    }
}
