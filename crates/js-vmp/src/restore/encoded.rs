//! jsfuck and jjencode. Both encoders hand their payload to `Function` at the
//! end; the realm runs in capture mode, so that source text comes back as a
//! string instead of being executed. `return "…"` layers are peeled with
//! further passes.

use anyhow::Result;
use tracing::{debug, instrument};

use super::rewrite;
use super::StrategyContext;
use crate::lexical::CodeMap;
use crate::sandbox::{DynamicCodePolicy, SandboxExecuteResult};
use crate::types::{RestoreResult, UnresolvedPart, VmType};

const DECODED: f64 = 0.9;
const NOT_A_STRING: f64 = 0.2;
const FAILED: f64 = 0.1;

#[instrument(skip_all, fields(len = code.len()))]
pub(crate) fn restore_jsfuck(code: &str, ctx: &StrategyContext<'_>) -> Result<RestoreResult> {
    if let Some(refused) = refuse_oversized(code, VmType::JsFuck, ctx) {
        return Ok(refused);
    }
    Ok(decode(code, code.trim().to_string(), VmType::JsFuck, ctx))
}

#[instrument(skip_all, fields(len = code.len()))]
pub(crate) fn restore_jjencode(code: &str, ctx: &StrategyContext<'_>) -> Result<RestoreResult> {
    if let Some(refused) = refuse_oversized(code, VmType::JjEncode, ctx) {
        return Ok(refused);
    }
    match explicit_entry_call(code)? {
        Some(program) => Ok(decode(code, program, VmType::JjEncode, ctx)),
        None => Ok(RestoreResult::fallback(
            code,
            FAILED,
            "jjencode entry point not found on the last line",
        )),
    }
}

fn refuse_oversized(
    code: &str,
    family: VmType,
    ctx: &StrategyContext<'_>,
) -> Option<RestoreResult> {
    (code.len() > ctx.config.encoded_size_limit).then(|| {
        RestoreResult::fallback(
            code,
            FAILED,
            format!(
                "{} input of {} bytes exceeds the {} byte limit; not evaluated",
                family,
                code.len(),
                ctx.config.encoded_size_limit
            ),
        )
    })
}

/// Rewrites `V.$(V.$(payload)())()` on the last non-blank line into
/// `V.$(payload)()`, which yields the payload source instead of running it.
pub(crate) fn explicit_entry_call(code: &str) -> Result<Option<String>> {
    let marker = rewrite::compile(r"^\s*([A-Za-z_$][\w$]*)\.\$\(\s*([A-Za-z_$][\w$]*)\.\$\(")?;
    let Some(line_start) = last_line_start(code) else { return Ok(None) };
    let line = &code[line_start..];
    let Some(caps) = marker.captures(line) else { return Ok(None) };
    let (Some(outer), Some(inner), Some(whole)) = (caps.get(1), caps.get(2), caps.get(0)) else {
        return Ok(None);
    };
    if outer.as_str() != inner.as_str() {
        return Ok(None);
    }
    let map = CodeMap::new(code);
    let inner_open = line_start + whole.end() - 1;
    let Some(inner_close) = map.matching_close(inner_open) else { return Ok(None) };
    let payload = &code[inner_open + 1..inner_close];
    let prefix = &code[..line_start];
    Ok(Some(format!("{}{}.$({})()", prefix, inner.as_str(), payload)))
}

fn last_line_start(code: &str) -> Option<usize> {
    let trimmed = code.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.rfind('\n').map(|n| n + 1).unwrap_or(0))
}

fn decode(
    original: &str,
    program: String,
    family: VmType,
    ctx: &StrategyContext<'_>,
) -> RestoreResult {
    let passes = ctx.options.max_iterations.max(1);
    let mut source = program;
    let mut decoded: Option<String> = None;
    let mut warnings = Vec::new();
    for pass in 0..passes {
        let outcome = ctx.evaluate(source.clone(), DynamicCodePolicy::Capture);
        let text = match classify(&outcome) {
            Ok(text) => text,
            Err(mut failure) => {
                if decoded.is_some() {
                    let reason = failure.warnings.join("; ");
                    warnings.push(format!("layer {} left encoded: {}", pass + 1, reason));
                    break;
                }
                failure.code = original.to_string();
                if outcome.timed_out {
                    failure.unresolved_parts.push(UnresolvedPart {
                        location: family.to_string(),
                        reason: "payload evaluation timed out".into(),
                        suggestion: "increase timeout_ms".into(),
                    });
                }
                return failure;
            }
        };
        debug!(pass, len = text.len(), "encoded layer decoded");
        let next_layer = text
            .trim_start()
            .starts_with("return")
            .then(|| format!("(function () {{ {} }})()", text));
        decoded = Some(text);
        match next_layer {
            Some(layer) => source = layer,
            None => break,
        }
    }
    match decoded {
        Some(text) => {
            let mut result = RestoreResult::new(text, DECODED);
            result.warnings = warnings;
            result
        }
        None => {
            let reason = format!("{} payload produced no output", family);
            RestoreResult::fallback(original, FAILED, reason)
        }
    }
}

fn classify(outcome: &SandboxExecuteResult) -> std::result::Result<String, RestoreResult> {
    if !outcome.ok {
        let reason = outcome.error.clone().unwrap_or_else(|| "sandbox evaluation failed".into());
        return Err(RestoreResult::fallback("", FAILED, reason));
    }
    match outcome.output_str() {
        Some(text) => Ok(text.to_string()),
        None => {
            let reason = "evaluation did not produce a string";
            Err(RestoreResult::fallback("", NOT_A_STRING, reason))
        }
    }
}
