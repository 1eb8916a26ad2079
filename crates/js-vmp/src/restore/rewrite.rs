//! Source rewrites shared by the restoration strategies. All of them only
//! touch code, never string literal bodies or comments.

use std::ops::Range;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

use crate::lexical::{replace_in_code, CodeMap};

pub(crate) fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid rewrite pattern {}", pattern))
}

/// A `var _0x… = [ … ]` declaration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StringArray {
    pub name: String,
    /// Byte range of the `[ … ]` literal
    pub literal: Range<usize>,
}

/// First obfuscator.io string table, located with a balanced bracket scan
/// so that nested brackets inside the elements are handled.
pub(crate) fn find_string_array(code: &str) -> Result<Option<StringArray>> {
    let declaration = compile(r"(?:var|let|const)\s+(_0x[0-9a-fA-F]+)\s*=\s*\[")?;
    let map = CodeMap::new(code);
    let masked = map.masked();
    for caps in declaration.captures_iter(&masked) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else { continue };
        let open = whole.end() - 1;
        if !map.is_code(whole.start()) {
            continue;
        }
        if let Some(close) = map.matching_close(open) {
            let name = name.as_str().to_string();
            return Ok(Some(StringArray { name, literal: open..close + 1 }));
        }
    }
    Ok(None)
}

/// Whether the table is rotated at runtime with `push(shift())`.
pub(crate) fn is_rotated(code: &str, name: &str) -> Result<bool> {
    let rotation = compile(&format!(
        concat!(
            r#"{name}\s*(?:\.push|\[\s*['"]push['"]\s*\])\s*\("#,
            r#"\s*{name}\s*(?:\.shift|\[\s*['"]shift['"]\s*\])\s*\(\s*\)\s*\)"#,
            r#"|\[\s*['"]push['"]\s*\]\s*\(\s*[\w$]+\s*\[\s*['"]shift['"]\s*\]"#,
        ),
        name = regex::escape(name)
    ))?;
    Ok(rotation.is_match(code))
}

/// Replaces `name[i]` (decimal or hex index) with the JSON literal of the
/// decoded element. Out-of-range indices are left alone.
pub(crate) fn inline_array_refs(
    code: &str,
    table: &StringArray,
    values: &[Value],
) -> Result<(String, usize)> {
    let reference = compile(&format!(
        r"(^|[^\w$.]){}\s*\[\s*(0[xX][0-9a-fA-F]+|\d+)\s*\]",
        regex::escape(&table.name)
    ))?;
    let (head, rest) = code.split_at(table.literal.end);
    let (rewritten, count) = replace_in_code(rest, &reference, |caps| {
        let index = caps.get(2).and_then(|m| crate::lexical::parse_number(m.as_str()))? as usize;
        let literal = serde_json::to_string(values.get(index)?).ok()?;
        let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        Some(format!("{}{}", prefix, literal))
    });
    Ok((format!("{}{}", head, rewritten), count))
}

const SELF_DEFENSE_MARKERS: [&str; 6] = [
    "debugger",
    "[native code]",
    "while (true) {}",
    "while(true){}",
    "console.clear",
    "toString().search",
];

/// Removes immediately invoked wrappers whose body carries an anti-debug or
/// anti-tamper marker. Wrappers covering most of the program are kept.
pub(crate) fn strip_self_defense(code: &str) -> Result<(String, usize)> {
    let starts = compile(r"[(!]\s*function\b|\(\s*\(\s*\)\s*=>")?;
    let map = CodeMap::new(code);
    let masked = map.masked();
    let mut spans: Vec<Range<usize>> = Vec::new();
    for found in starts.find_iter(&masked) {
        let overlaps = spans.last().is_some_and(|last| found.start() < last.end);
        if overlaps || !map.is_code(found.start()) {
            continue;
        }
        let Some(span) = invocation_span(&map, found.start()) else { continue };
        let body = &code[span.clone()];
        if span.len() * 2 > code.len() || !SELF_DEFENSE_MARKERS.iter().any(|m| body.contains(m)) {
            continue;
        }
        spans.push(span);
    }
    let mut out = String::with_capacity(code.len());
    let mut last = 0;
    for span in &spans {
        out.push_str(&code[last..span.start]);
        last = span.end;
    }
    out.push_str(&code[last..]);
    Ok((out, spans.len()))
}

/// Extent of `(function(){…})()`, `(function(){…}())` or `!function(){…}()`
/// starting at `start`, including a trailing semicolon.
fn invocation_span(map: &CodeMap<'_>, start: usize) -> Option<Range<usize>> {
    let bytes = map.src().as_bytes();
    let body_open = map.next_code_byte(start, b'{')?;
    let body_close = map.matching_close(body_open)?;
    let mut end = body_close + 1;
    let wrapped = bytes[start] == b'(';
    if wrapped {
        let outer_close = map.matching_close(start)?;
        if outer_close < body_close {
            return None;
        }
        end = outer_close + 1;
    }
    let call_open = skip_ws(bytes, end);
    if bytes.get(call_open) == Some(&b'(') {
        end = map.matching_close(call_open)? + 1;
    } else if !wrapped || !ends_with_call(&bytes[body_close + 1..end]) {
        return None;
    }
    let semi = skip_ws(bytes, end);
    if bytes.get(semi) == Some(&b';') {
        end = semi + 1;
    }
    Some(start..end)
}

fn ends_with_call(tail: &[u8]) -> bool {
    let compact: Vec<u8> = tail.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    compact.starts_with(b"(") && compact.ends_with(b")")
}

fn skip_ws(bytes: &[u8], mut at: usize) -> usize {
    while bytes.get(at).is_some_and(|b| b.is_ascii_whitespace()) {
        at += 1;
    }
    at
}

/// Body of a program that consists of a single argument-less IIFE.
pub(crate) fn unwrap_iife(code: &str) -> Option<String> {
    let map = CodeMap::new(code);
    let start = skip_ws(code.as_bytes(), 0);
    let span = invocation_span(&map, start)?;
    if !code[span.end..].trim().is_empty() {
        return None;
    }
    let body_open = map.next_code_byte(start, b'{')?;
    let head = &code[start..body_open];
    if !head.replace(char::is_whitespace, "").ends_with("()") && !head.contains("()") {
        return None;
    }
    let body_close = map.matching_close(body_open)?;
    let tail: String =
        code[body_close + 1..span.end].chars().filter(|c| !c.is_whitespace()).collect();
    if !matches!(tail.as_str(), ")()" | ")();" | "())" | "());" | "()" | "();") {
        return None;
    }
    let body = code[body_open + 1..body_close].trim();
    let body = body
        .strip_prefix("'use strict';")
        .or_else(|| body.strip_prefix("\"use strict\";"))
        .unwrap_or(body);
    Some(body.trim().to_string())
}

/// `0x1f` → `31`. Literals that do not fit in 53 bits are kept.
pub(crate) fn collapse_hex_literals(code: &str) -> Result<(String, usize)> {
    let hex = compile(r"(^|[^\w$.])0[xX]([0-9a-fA-F]{1,13})\b")?;
    Ok(replace_in_code(code, &hex, |caps| {
        let digits = caps.get(2)?.as_str();
        let value = u64::from_str_radix(digits, 16).ok()?;
        let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        Some(format!("{}{}", prefix, value))
    }))
}
