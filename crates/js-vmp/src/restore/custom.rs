use anyhow::Result;
use regex::Captures;
use tracing::{debug, instrument};

use super::rewrite::compile;
use super::{assistant, StrategyContext};
use crate::lexical::{replace_all_in_code, replace_in_code};
use crate::types::{RestoreResult, UnresolvedPart, VmFeatures};

const BASELINE: f64 = 0.3;
const PER_REWRITE: f64 = 0.05;
const CEILING: f64 = 0.45;

/// Rounds of boolean folding; `!!![]` needs two.
const FOLD_ROUNDS: usize = 4;

/// Conservative static cleanups for an unrecognised VM. The bytecode itself
/// is left for the symbolic executor.
#[instrument(skip_all, fields(len = code.len()))]
pub(crate) fn restore(
    code: &str,
    features: Option<&VmFeatures>,
    ctx: &StrategyContext<'_>,
) -> Result<RestoreResult> {
    let mut current = code.to_string();
    let mut applied = 0usize;

    let folded = fold_booleans(&current)?;
    if folded.1 > 0 {
        current = folded.0;
        applied += 1;
    }
    let pruned = drop_empty_ifs(&current)?;
    if pruned.1 > 0 {
        current = pruned.0;
        applied += 1;
    }
    let ternaries = drop_redundant_ternaries(&current)?;
    if ternaries.1 > 0 {
        current = ternaries.0;
        applied += 1;
    }
    if ctx.options.aggressive {
        let debugger = compile(r"\bdebugger\b\s*;?")?;
        let (out, count) = replace_all_in_code(&current, &debugger, "");
        if count > 0 {
            current = out.into_owned();
            applied += 1;
        }
    }
    debug!(applied, "static rewrites applied");

    let confidence = (BASELINE + PER_REWRITE * applied as f64).min(CEILING);
    let mut result = RestoreResult::new(current, confidence);
    result.unresolved_parts.push(UnresolvedPart {
        location: features
            .and_then(|f| f.interpreter_location)
            .map(|l| format!("interpreter at {}", l))
            .unwrap_or_else(|| "interpreter".into()),
        reason: "custom VM bytecode semantics are not statically recoverable".into(),
        suggestion: "replay the extracted instructions with the symbolic executor \
                     (execute_jsvmp)"
            .into(),
    });

    if let Some(helper) = ctx.assistant {
        let prompt = assistant::build_prompt(code, features, ctx.config.max_prompt_chars);
        assistant::consult(helper, &prompt, ctx.config.assistant_confidence, &mut result);
    }
    Ok(result)
}

/// `!![]` → `true`, `![]` → `false`, `!0` → `true`, `!1` → `false` and the
/// negations of the resulting literals.
fn fold_booleans(code: &str) -> Result<(String, usize)> {
    let rules = [
        (compile(r"!!\[\]")?, "true"),
        (compile(r"!\[\]")?, "false"),
        (compile(r"(^|[^\w$.])!0([^\w$.]|$)")?, "${1}true${2}"),
        (compile(r"(^|[^\w$.])!1([^\w$.]|$)")?, "${1}false${2}"),
        (compile(r"!true\b")?, "false"),
        (compile(r"!false\b")?, "true"),
    ];
    let mut current = code.to_string();
    let mut total = 0;
    for _ in 0..FOLD_ROUNDS {
        let mut round = 0;
        for (pattern, replacement) in &rules {
            let (out, count) = replace_all_in_code(&current, pattern, replacement);
            if count > 0 {
                current = out.into_owned();
                round += count;
            }
        }
        if round == 0 {
            break;
        }
        total += round;
    }
    Ok((current, total))
}

/// Removes `if (cond) {}` without an `else` when `cond` is a plain name,
/// literal or member chain.
fn drop_empty_ifs(code: &str) -> Result<(String, usize)> {
    let empty_if = compile(r"\bif\s*\(\s*!*[\w$.]+\s*\)\s*\{\s*\}\s*;?(\s*else\b)?")?;
    Ok(replace_in_code(code, &empty_if, |caps| {
        caps.get(1).is_none().then(String::new)
    }))
}

/// `true ? a : b` → `a`, `false ? a : b` → `b`, `c ? a : a` → `a`, for
/// operands that are names, numbers or member chains.
fn drop_redundant_ternaries(code: &str) -> Result<(String, usize)> {
    let ternary = compile(
        concat!(
            r"(^|[=(,;{}\[]|\breturn)(\s*)",
            r"([\w$.]+)\s*\?\s*([\w$.]+)\s*:\s*([\w$.]+)",
            r"(\s*(?:[;,)\]}]|$))",
        ),
    )?;
    Ok(replace_in_code(code, &ternary, |caps: &Captures<'_>| {
        let text = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
        let chosen = match text(3) {
            "true" => text(4),
            "false" => text(5),
            _ if text(4) == text(5) => text(4),
            _ => return None,
        };
        Some(format!("{}{}{}{}", text(1), text(2), chosen, text(6)))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::sandbox::Sandbox;
    use crate::types::DeobfuscateOptions;

    fn run(
        code: &str,
        aggressive: bool,
        helper: Option<&dyn assistant::ReasoningAssistant>,
    ) -> RestoreResult {
        let sandbox = Sandbox::default();
        let config = StrategyConfig::default();
        let options = DeobfuscateOptions { aggressive, ..DeobfuscateOptions::default() };
        let ctx = StrategyContext {
            sandbox: &sandbox,
            config: &config,
            options: &options,
            assistant: helper,
        };
        restore(code, None, &ctx).unwrap()
    }

    #[test]
    fn folds_boolean_idioms() {
        let code = "a = !![]; b = ![]; c = !0; d = !1; e = !!![]; f = x!0; g = '!0';";
        let (out, _) = fold_booleans(code).unwrap();
        assert_eq!(
            out,
            "a = true; b = false; c = true; d = false; e = false; f = x!0; g = '!0';"
        );
    }

    #[test]
    fn fractional_negations_are_kept() {
        let (out, count) = fold_booleans("a = !0.5; b = !1.25; c = [!0,!1];").unwrap();
        assert_eq!(out, "a = !0.5; b = !1.25; c = [true,false];");
        assert_eq!(count, 2);
    }

    #[test]
    fn removes_only_empty_ifs() {
        let code = "if (flag) {} if (a.b) { }; if (x) {} else { y(); } if (f()) {}";
        let (out, count) = drop_empty_ifs(code).unwrap();
        assert_eq!(count, 2);
        assert_eq!(out, " if (x) {} else { y(); } if (f()) {}");
    }

    #[test]
    fn simplifies_ternaries() {
        let code = "x = true ? a : b; y = false ? a : b; z = c ? d : d; w = c ? d : e;";
        let (out, count) = drop_redundant_ternaries(code).unwrap();
        assert_eq!(count, 3);
        assert_eq!(out, "x = a; y = b; z = d; w = c ? d : e;");
    }

    #[test]
    fn confidence_grows_per_rewrite_and_is_capped() {
        let plain = run("var x = 1;", false, None);
        assert_eq!(plain.confidence, BASELINE);
        assert_eq!(plain.unresolved_parts.len(), 1);
        assert!(plain.unresolved_parts[0].suggestion.contains("symbolic executor"));

        let busy = run("debugger; if (t) {} x = !![] ? a : a;", true, None);
        assert!(!busy.code.contains("debugger"));
        assert!((busy.confidence - CEILING).abs() < 1e-9);
    }

    #[test]
    fn assistant_pins_confidence() {
        let helper = |_: &str| -> anyhow::Result<String> {
            Ok(r#"{"warnings":["handler 3 decrypts strings"]}"#.into())
        };
        let result = run("x = !0;", false, Some(&helper));
        assert_eq!(result.code, "x = true;");
        assert_eq!(result.confidence, 0.6);
        assert_eq!(result.warnings, vec!["assistant: handler 3 decrypts strings"]);
        assert_eq!(result.unresolved_parts.len(), 1);
    }
}
