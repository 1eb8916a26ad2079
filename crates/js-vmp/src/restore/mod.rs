//! Restoration pipeline: detect, identify, extract, replay, then run the
//! strategy for the identified family.

mod assistant;
mod custom;
mod encoded;
mod obfuscator_io;
mod rewrite;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use tracing::{debug, instrument, warn};

use crate::config::{RestoreConfig, StrategyConfig, SymbolicConfig};
use crate::detector::{detect_with, identify_vm_type};
use crate::extractor::extract_instructions;
use crate::sandbox::{elapsed_ms, DynamicCodePolicy, Sandbox, SandboxExecuteResult};
use crate::symbolic::execute_with;
use crate::types::{
    DeobfuscateOptions, DeobfuscateResult, RestoreResult, RestoreStats, SymbolicSummary,
    UnresolvedPart, VmFeatures, VmType,
};

pub use assistant::ReasoningAssistant;

/// Confidence of the result returned when a strategy fails outright.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

pub(crate) struct StrategyContext<'a> {
    pub sandbox: &'a Sandbox,
    pub config: &'a StrategyConfig,
    pub options: &'a DeobfuscateOptions,
    pub assistant: Option<&'a dyn ReasoningAssistant>,
}

impl StrategyContext<'_> {
    pub(crate) fn evaluate(
        &self,
        code: String,
        dynamic_code: DynamicCodePolicy,
    ) -> SandboxExecuteResult {
        let request = self
            .sandbox
            .request(code)
            .with_timeout(self.options.timeout_ms)
            .with_dynamic_code(dynamic_code);
        self.sandbox.execute(&request)
    }
}

pub struct Deobfuscator {
    config: RestoreConfig,
    sandbox: Sandbox,
    assistant: Option<Box<dyn ReasoningAssistant + Send + Sync>>,
}

impl Default for Deobfuscator {
    fn default() -> Self {
        Self::new(RestoreConfig::default())
    }
}

impl Deobfuscator {
    pub fn new(config: RestoreConfig) -> Self {
        let sandbox = Sandbox::new(config.sandbox.clone());
        Self { config, sandbox, assistant: None }
    }

    /// Shares an existing sandbox, and with it its concurrency limit.
    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_assistant(
        mut self,
        assistant: impl ReasoningAssistant + Send + Sync + 'static,
    ) -> Self {
        self.assistant = Some(Box::new(assistant));
        self
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Full pipeline. Code without interpreter signals comes back unchanged
    /// at confidence 0.
    #[instrument(skip_all, fields(len = code.len(), aggressive = options.aggressive))]
    pub fn deobfuscate(&self, code: &str, options: &DeobfuscateOptions) -> DeobfuscateResult {
        let started = Instant::now();
        let Some(features) = detect_with(code, &self.config.detector) else {
            debug!("no VM protection detected");
            return DeobfuscateResult {
                is_jsvmp: false,
                vm_type: None,
                vm_features: None,
                instructions: Vec::new(),
                deobfuscated_code: code.to_string(),
                confidence: 0.0,
                warnings: Vec::new(),
                unresolved_parts: Vec::new(),
                symbolic: None,
                stats: RestoreStats::measure(code, code, elapsed_ms(started)),
            };
        };
        let vm_type = identify_vm_type(code, &features);
        debug!(vm_type = %vm_type, handlers = features.instruction_count, "VM protection detected");

        let mut warnings = Vec::new();
        let mut unresolved_parts = Vec::new();
        let instructions = if options.extract_instructions {
            extract_instructions(code, &features)
        } else {
            Vec::new()
        };
        if options.extract_instructions && instructions.is_empty() {
            unresolved_parts.push(UnresolvedPart {
                location: interpreter_label(&features),
                reason: "no instruction handlers could be extracted".into(),
                suggestion: "locate the dispatch loop manually and supply instructions to \
                             execute_jsvmp"
                    .into(),
            });
        }

        let symbolic = (!instructions.is_empty()).then(|| {
            let config =
                SymbolicConfig { timeout_ms: options.timeout_ms, ..self.config.symbolic.clone() };
            let execution = execute_with(&instructions, &config);
            warnings.extend(execution.warnings.iter().map(|w| format!("symbolic: {}", w)));
            SymbolicSummary {
                inferred_logic: execution.inferred_logic,
                steps: execution.execution_trace.len(),
                confidence: execution.confidence,
                constraint_count: execution.constraints.len(),
            }
        });

        let restored = self.run_strategy(code, vm_type, Some(&features), options);
        warnings.extend(restored.warnings);
        unresolved_parts.extend(restored.unresolved_parts);
        let stats = RestoreStats::measure(code, &restored.code, elapsed_ms(started));
        debug!(
            vm_type = %vm_type,
            confidence = restored.confidence,
            duration_ms = stats.processing_time_ms,
            "restoration finished"
        );
        DeobfuscateResult {
            is_jsvmp: true,
            vm_type: Some(vm_type),
            vm_features: Some(features),
            instructions,
            deobfuscated_code: restored.code,
            confidence: restored.confidence,
            warnings,
            unresolved_parts,
            symbolic,
            stats,
        }
    }

    /// Runs one family strategy without the detector gate.
    #[instrument(skip_all, fields(vm_type = %vm_type, len = code.len()))]
    pub fn restore_as(
        &self,
        code: &str,
        vm_type: VmType,
        options: &DeobfuscateOptions,
    ) -> RestoreResult {
        let features = detect_with(code, &self.config.detector);
        self.run_strategy(code, vm_type, features.as_ref(), options)
    }

    fn run_strategy(
        &self,
        code: &str,
        vm_type: VmType,
        features: Option<&VmFeatures>,
        options: &DeobfuscateOptions,
    ) -> RestoreResult {
        let ctx = StrategyContext {
            sandbox: &self.sandbox,
            config: &self.config.restore,
            options,
            assistant: self.assistant.as_deref().map(|a| a as &dyn ReasoningAssistant),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| match vm_type {
            VmType::ObfuscatorIo => obfuscator_io::restore(code, &ctx),
            VmType::JsFuck => encoded::restore_jsfuck(code, &ctx),
            VmType::JjEncode => encoded::restore_jjencode(code, &ctx),
            VmType::Custom => custom::restore(code, features, &ctx),
        }));
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(vm_type = %vm_type, error = %err, "restoration strategy failed");
                let reason = format!("{} strategy failed: {:#}", vm_type, err);
                RestoreResult::fallback(code, FALLBACK_CONFIDENCE, reason)
            }
            Err(_) => {
                warn!(vm_type = %vm_type, "restoration strategy panicked");
                let reason = format!("{} strategy aborted unexpectedly", vm_type);
                RestoreResult::fallback(code, FALLBACK_CONFIDENCE, reason)
            }
        };
        if result.code.trim().is_empty() {
            result.code = code.to_string();
            result.warn("strategy produced no code; original kept");
        }
        result
    }
}

fn interpreter_label(features: &VmFeatures) -> String {
    features
        .interpreter_location
        .map(|l| format!("interpreter at {}", l))
        .unwrap_or_else(|| "interpreter".into())
}

/// [`Deobfuscator::deobfuscate`] with the default configuration.
pub fn deobfuscate(code: &str, options: &DeobfuscateOptions) -> DeobfuscateResult {
    Deobfuscator::default().deobfuscate(code, options)
}
