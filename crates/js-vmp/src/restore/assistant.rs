//! Optional reasoning assistant for VMs no family strategy recognises.
//! Its answers are unverified: they only add warnings and unresolved parts.

use serde::Deserialize;
use tracing::debug;

use crate::types::{RestoreResult, UnresolvedPart, VmFeatures};

/// Free-text prompt in, free-text (ideally JSON) answer out.
pub trait ReasoningAssistant {
    fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

impl<F> ReasoningAssistant for F
where
    F: Fn(&str) -> anyhow::Result<String>,
{
    fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self(prompt)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssistantReport {
    warnings: Vec<String>,
    #[serde(alias = "unresolvedParts")]
    unresolved_parts: Vec<UnresolvedPart>,
}

pub(crate) fn build_prompt(code: &str, features: Option<&VmFeatures>, max_chars: usize) -> String {
    let excerpt: String = code.chars().take(max_chars).collect();
    let truncated = if excerpt.len() < code.len() { " (truncated)" } else { "" };
    let mut prompt = String::from(
        "The following JavaScript is protected by an unidentified virtual-machine obfuscator.\n",
    );
    if let Some(features) = features {
        prompt.push_str(&format!(
            "Detected interpreter: {} handlers, complexity {}",
            features.instruction_count,
            features.complexity.as_str()
        ));
        if let Some(location) = &features.interpreter_location {
            prompt.push_str(&format!(", dispatch switch at {}", location));
        }
        prompt.push_str(".\n");
    }
    prompt.push_str(
        "Reply with JSON only: {\"warnings\": [string], \"unresolvedParts\": \
         [{\"location\": string, \"reason\": string, \"suggestion\": string}]}.\n",
    );
    prompt.push_str(&format!("Source{}:\n{}", truncated, excerpt));
    prompt
}

/// Accepts a bare JSON object or one embedded in surrounding prose or a
/// fenced block.
fn parse_report(answer: &str) -> Option<AssistantReport> {
    if let Ok(report) = serde_json::from_str(answer.trim()) {
        return Some(report);
    }
    let start = answer.find('{')?;
    let end = answer.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&answer[start..=end]).ok()
}

/// Appends the assistant's findings. Returns false when the assistant failed
/// or answered with something unparseable; `result` is untouched then.
pub(crate) fn consult(
    assistant: &dyn ReasoningAssistant,
    prompt: &str,
    pinned_confidence: f64,
    result: &mut RestoreResult,
) -> bool {
    let answer = match assistant.complete(prompt) {
        Ok(answer) => answer,
        Err(err) => {
            debug!(error = %err, "reasoning assistant failed");
            return false;
        }
    };
    let Some(report) = parse_report(&answer) else {
        debug!(len = answer.len(), "reasoning assistant answer was not structured");
        return false;
    };
    result
        .warnings
        .extend(report.warnings.into_iter().map(|w| format!("assistant: {}", w)));
    result.unresolved_parts.extend(report.unresolved_parts);
    result.set_confidence(pinned_confidence);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answering(text: &'static str) -> impl ReasoningAssistant {
        move |_: &str| -> anyhow::Result<String> { Ok(text.to_string()) }
    }

    #[test]
    fn merges_structured_answer() {
        let mut result = RestoreResult::new("code", 0.35);
        let assistant = answering(
            concat!(
                "Sure:\n```json\n{\"warnings\":[\"opcode 7 looks like XOR\"],",
                "\"unresolvedParts\":[{\"location\":\"case 7\",\"reason\":\"r\",",
                "\"suggestion\":\"s\"}]}\n```",
            ),
        );
        assert!(consult(&assistant, "p", 0.6, &mut result));
        assert_eq!(result.warnings, vec!["assistant: opcode 7 looks like XOR"]);
        assert_eq!(result.unresolved_parts[0].location, "case 7");
        assert_eq!(result.confidence, 0.6);
        assert_eq!(result.code, "code");
    }

    #[test]
    fn unparseable_answer_is_ignored() {
        let mut result = RestoreResult::new("code", 0.35);
        assert!(!consult(&answering("no idea"), "p", 0.6, &mut result));
        let failing = |_: &str| -> anyhow::Result<String> { anyhow::bail!("offline") };
        assert!(!consult(&failing, "p", 0.6, &mut result));
        assert_eq!(result, RestoreResult::new("code", 0.35));
    }

    #[test]
    fn prompt_is_bounded() {
        let code = "x".repeat(100);
        let prompt = build_prompt(&code, None, 10);
        assert!(prompt.contains("(truncated)"));
        assert!(prompt.ends_with(&"x".repeat(10)));
        assert!(!prompt.contains(&"x".repeat(11)));
    }
}
