use anyhow::Result;
use serde_json::Value;
use tracing::{debug, instrument};

use super::rewrite;
use super::StrategyContext;
use crate::sandbox::DynamicCodePolicy;
use crate::types::{RestoreResult, UnresolvedPart};

const BASELINE: f64 = 0.1;
const DECODED_TABLE: f64 = 0.3;
const INLINED_REFERENCES: f64 = 0.2;
const STEP: f64 = 0.1;

/// Decodes the `_0x` string table in the sandbox, inlines its references and
/// removes guard wrappers. Each successful step adds to the confidence.
#[instrument(skip_all, fields(len = code.len()))]
pub(crate) fn restore(code: &str, ctx: &StrategyContext<'_>) -> Result<RestoreResult> {
    let mut result = RestoreResult::new(code, BASELINE);
    let mut current = code.to_string();

    match rewrite::find_string_array(&current)? {
        None => result.warn("no _0x string array found"),
        Some(table) => {
            let literal = &current[table.literal.clone()];
            let outcome =
                ctx.evaluate(format!("JSON.stringify({})", literal), DynamicCodePolicy::Deny);
            let decoded = outcome
                .output_str()
                .and_then(|json| serde_json::from_str::<Vec<Value>>(json).ok());
            match decoded {
                Some(values) => {
                    result.raise(DECODED_TABLE);
                    debug!(name = %table.name, elements = values.len(), "string array decoded");
                    if rewrite::is_rotated(&current, &table.name)? {
                        result.warn(format!(
                            "{} is rotated at runtime; inlined strings may be offset",
                            table.name
                        ));
                    }
                    let (inlined, count) = rewrite::inline_array_refs(&current, &table, &values)?;
                    if count > 0 {
                        current = inlined;
                        result.raise(INLINED_REFERENCES);
                    } else {
                        result.warn(format!("no indexed references to {} found", table.name));
                    }
                }
                None if outcome.timed_out => result.unresolved_parts.push(UnresolvedPart {
                    location: table.name.clone(),
                    reason: "string array evaluation timed out".into(),
                    suggestion: "increase timeout_ms or decode the table manually".into(),
                }),
                None => result.warn(format!(
                    "string array decode failed: {}",
                    outcome.error.as_deref().unwrap_or("output was not an array")
                )),
            }
        }
    }

    let (stripped, wrappers) = rewrite::strip_self_defense(&current)?;
    if wrappers > 0 {
        debug!(wrappers, "self-defense wrappers removed");
        current = stripped;
        result.raise(STEP);
    }

    if ctx.options.aggressive {
        if let Some(body) = rewrite::unwrap_iife(&current) {
            current = body;
            result.raise(STEP);
        }
        let (collapsed, literals) = rewrite::collapse_hex_literals(&current)?;
        if literals > 0 {
            current = collapsed;
            result.raise(STEP);
        }
    }

    result.code = current;
    Ok(result)
}
