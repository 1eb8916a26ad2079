#[cfg(feature = "js-ast")]
mod ast;
pub mod config;
pub mod detector;
pub mod extractor;
mod lexical;
pub mod restore;
pub mod sandbox;
pub mod symbolic;
pub mod types;

pub use config::{
    DetectorConfig, Isolation, RestoreConfig, SandboxConfig, StrategyConfig, SymbolicConfig,
};
pub use detector::{detect, detect_with, identify_vm_type};
pub use extractor::extract_instructions;
pub use restore::{deobfuscate, Deobfuscator, ReasoningAssistant};
pub use sandbox::{DynamicCodePolicy, Sandbox, SandboxExecuteRequest, SandboxExecuteResult};
pub use symbolic::{
    execute_jsvmp, execute_with, ExecutionResult, SymbolicState, SymbolicValue, Termination,
};
pub use types::{
    Complexity, DeobfuscateOptions, DeobfuscateResult, InstructionKind, Opcode, Operand,
    RestoreResult, VmFeatures, VmInstruction, VmType,
};
