use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Operand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Constant,
    Expression,
    Memory,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Equality,
    Inequality,
    Definition,
    Assignment,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(rename = "type")]
    pub kind: ConstraintKind,
    pub expression: String,
    pub description: String,
}

/// A value known only by the expression that defines it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicValue {
    #[serde(rename = "type")]
    pub kind: ValueKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_values: Vec<Operand>,
    pub constraints: Vec<Constraint>,
}

impl SymbolicValue {
    pub fn constant(literal: Operand) -> Self {
        Self {
            kind: ValueKind::Constant,
            name: literal.to_string(),
            possible_values: vec![literal],
            constraints: Vec::new(),
        }
    }

    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Unknown,
            name: name.into(),
            possible_values: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Operand text with parentheses when it is itself a compound expression.
    pub fn operand_text(&self) -> String {
        if self.kind == ValueKind::Expression {
            format!("({})", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn binary(lhs: &SymbolicValue, op: &str, rhs: &SymbolicValue) -> Self {
        let name = format!("{} {} {}", lhs.operand_text(), op, rhs.operand_text());
        let definition = Constraint {
            kind: ConstraintKind::Definition,
            expression: name.clone(),
            description: format!("result of {} applied to {} and {}", op, lhs.name, rhs.name),
        };
        Self {
            kind: ValueKind::Expression,
            name,
            possible_values: Vec::new(),
            constraints: vec![definition],
        }
    }

    pub fn unary(op: &str, operand: &SymbolicValue) -> Self {
        let name = format!("{}{}", op, operand.operand_text());
        let definition = Constraint {
            kind: ConstraintKind::Definition,
            expression: name.clone(),
            description: format!("result of {} applied to {}", op, operand.name),
        };
        Self {
            kind: ValueKind::Expression,
            name,
            possible_values: Vec::new(),
            constraints: vec![definition],
        }
    }
}

impl fmt::Display for SymbolicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Abstract machine state. The executor clones it before every step, so
/// snapshots kept in a trace never change afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolicState {
    pub pc: usize,
    pub stack: Vec<SymbolicValue>,
    pub registers: BTreeMap<String, SymbolicValue>,
    pub memory: BTreeMap<String, SymbolicValue>,
    pub path_constraints: Vec<Constraint>,
}

impl SymbolicState {
    pub fn new() -> Self {
        Self::default()
    }
}
