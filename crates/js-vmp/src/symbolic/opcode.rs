use crate::types::{InstructionKind, VmInstruction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Push,
    Pop,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Not,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Jmp,
    Jz,
    Jnz,
    Call,
    Ret,
    Load,
    Store,
    LoadConst,
    Nop,
    Halt,
}

impl Mnemonic {
    pub const ALL: [Mnemonic; 28] = [
        Mnemonic::Push,
        Mnemonic::Pop,
        Mnemonic::Dup,
        Mnemonic::Add,
        Mnemonic::Sub,
        Mnemonic::Mul,
        Mnemonic::Div,
        Mnemonic::Mod,
        Mnemonic::And,
        Mnemonic::Or,
        Mnemonic::Not,
        Mnemonic::Xor,
        Mnemonic::Eq,
        Mnemonic::Ne,
        Mnemonic::Lt,
        Mnemonic::Le,
        Mnemonic::Gt,
        Mnemonic::Ge,
        Mnemonic::Jmp,
        Mnemonic::Jz,
        Mnemonic::Jnz,
        Mnemonic::Call,
        Mnemonic::Ret,
        Mnemonic::Load,
        Mnemonic::Store,
        Mnemonic::LoadConst,
        Mnemonic::Nop,
        Mnemonic::Halt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mnemonic::Push => "PUSH",
            Mnemonic::Pop => "POP",
            Mnemonic::Dup => "DUP",
            Mnemonic::Add => "ADD",
            Mnemonic::Sub => "SUB",
            Mnemonic::Mul => "MUL",
            Mnemonic::Div => "DIV",
            Mnemonic::Mod => "MOD",
            Mnemonic::And => "AND",
            Mnemonic::Or => "OR",
            Mnemonic::Not => "NOT",
            Mnemonic::Xor => "XOR",
            Mnemonic::Eq => "EQ",
            Mnemonic::Ne => "NE",
            Mnemonic::Lt => "LT",
            Mnemonic::Le => "LE",
            Mnemonic::Gt => "GT",
            Mnemonic::Ge => "GE",
            Mnemonic::Jmp => "JMP",
            Mnemonic::Jz => "JZ",
            Mnemonic::Jnz => "JNZ",
            Mnemonic::Call => "CALL",
            Mnemonic::Ret => "RET",
            Mnemonic::Load => "LOAD",
            Mnemonic::Store => "STORE",
            Mnemonic::LoadConst => "LOAD_CONST",
            Mnemonic::Nop => "NOP",
            Mnemonic::Halt => "HALT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|m| m.as_str().eq_ignore_ascii_case(name))
    }

    /// Source operator for binary opcodes.
    pub fn operator(self) -> Option<&'static str> {
        Some(match self {
            Mnemonic::Add => "+",
            Mnemonic::Sub => "-",
            Mnemonic::Mul => "*",
            Mnemonic::Div => "/",
            Mnemonic::Mod => "%",
            Mnemonic::And => "&",
            Mnemonic::Or => "|",
            Mnemonic::Xor => "^",
            Mnemonic::Eq => "==",
            Mnemonic::Ne => "!=",
            Mnemonic::Lt => "<",
            Mnemonic::Le => "<=",
            Mnemonic::Gt => ">",
            Mnemonic::Ge => ">=",
            _ => return None,
        })
    }
}

/// What one instruction does to the abstract machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Known(Mnemonic),
    /// Binary operation whose operator is unknown; the instruction name
    /// stands in for it.
    OpaqueBinary,
}

impl Step {
    /// Resolves an instruction by mnemonic, then by its inferred category.
    /// The flag is false when the category fallback was used.
    pub(crate) fn resolve(instruction: &VmInstruction) -> (Self, bool) {
        if let Some(mnemonic) = Mnemonic::from_name(&instruction.name) {
            return (Step::Known(mnemonic), true);
        }
        let step = match instruction.kind {
            InstructionKind::Load => Step::Known(Mnemonic::Load),
            InstructionKind::Store => Step::Known(Mnemonic::Store),
            InstructionKind::Arithmetic => Step::OpaqueBinary,
            InstructionKind::Call => Step::Known(Mnemonic::Call),
            InstructionKind::Control | InstructionKind::Unknown => Step::Known(Mnemonic::Nop),
        };
        (step, false)
    }
}
