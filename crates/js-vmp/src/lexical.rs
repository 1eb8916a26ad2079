//! Byte-level view of JavaScript source that separates code from string
//! literal bodies and comments. Regex passes run on the masked text so that
//! they never rewrite or count inside literals.

use std::borrow::Cow;

use regex::{Captures, Regex};

pub(crate) struct CodeMap<'a> {
    src: &'a str,
    code: Vec<bool>,
}

impl<'a> CodeMap<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        let bytes = src.as_bytes();
        let mut code = vec![true; bytes.len()];
        let mut last_significant: Option<usize> = None;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                quote @ (b'"' | b'\'' | b'`') => {
                    let mut j = i + 1;
                    while j < bytes.len() && bytes[j] != quote {
                        if bytes[j] == b'\\' && j + 1 < bytes.len() {
                            code[j] = false;
                            j += 1;
                        } else if bytes[j] == b'\n' && quote != b'`' {
                            break;
                        }
                        code[j] = false;
                        j += 1;
                    }
                    last_significant = Some(j.min(bytes.len() - 1));
                    i = j + 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    let mut j = i;
                    while j < bytes.len() && bytes[j] != b'\n' {
                        code[j] = false;
                        j += 1;
                    }
                    i = j;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    let mut j = i;
                    while j < bytes.len() {
                        code[j] = false;
                        if bytes[j] == b'/' && j > i + 1 && bytes[j - 1] == b'*' {
                            j += 1;
                            break;
                        }
                        j += 1;
                    }
                    i = j;
                }
                b'/' if regex_allowed(bytes, last_significant) => {
                    match regex_literal_end(bytes, i) {
                        Some(end) => {
                            code[i + 1..end].iter_mut().for_each(|c| *c = false);
                            last_significant = Some(end);
                            i = end + 1;
                        }
                        None => {
                            last_significant = Some(i);
                            i += 1;
                        }
                    }
                }
                b if b.is_ascii_whitespace() => i += 1,
                _ => {
                    last_significant = Some(i);
                    i += 1;
                }
            }
        }
        Self { src, code }
    }

    pub(crate) fn src(&self) -> &'a str {
        self.src
    }

    pub(crate) fn is_code(&self, offset: usize) -> bool {
        self.code.get(offset).copied().unwrap_or(false)
    }

    /// Source with literal bodies and comments blanked to spaces. Offsets are
    /// preserved and string delimiters stay in place.
    pub(crate) fn masked(&self) -> String {
        self.src
            .bytes()
            .zip(self.code.iter())
            .map(|(b, code)| if *code && b.is_ascii() { b as char } else { ' ' })
            .collect()
    }

    /// Offsets of `word` appearing as a standalone identifier in code.
    pub(crate) fn keyword_offsets(&self, word: &str) -> Vec<usize> {
        let bytes = self.src.as_bytes();
        let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$';
        self.src
            .match_indices(word)
            .map(|(offset, _)| offset)
            .filter(|offset| {
                let end = offset + word.len();
                self.is_code(*offset)
                    && (*offset == 0 || !is_ident(bytes[offset - 1]))
                    && (end >= bytes.len() || !is_ident(bytes[end]))
            })
            .collect()
    }

    /// Offset of the bracket closing the one at `open`, skipping literals.
    pub(crate) fn matching_close(&self, open: usize) -> Option<usize> {
        let bytes = self.src.as_bytes();
        let (open_b, close_b) = match bytes.get(open)? {
            b'(' => (b'(', b')'),
            b'[' => (b'[', b']'),
            b'{' => (b'{', b'}'),
            _ => return None,
        };
        let mut depth = 0usize;
        for (offset, b) in bytes.iter().enumerate().skip(open) {
            if !self.is_code(offset) || self.is_delimiter(offset) {
                continue;
            }
            if *b == open_b {
                depth += 1;
            } else if *b == close_b {
                depth -= 1;
                if depth == 0 {
                    return Some(offset);
                }
            }
        }
        None
    }

    /// First code byte at or after `from` equal to `needle`.
    pub(crate) fn next_code_byte(&self, from: usize, needle: u8) -> Option<usize> {
        let bytes = self.src.as_bytes();
        (from..bytes.len()).find(|offset| bytes[*offset] == needle && self.is_code(*offset))
    }

    fn is_delimiter(&self, offset: usize) -> bool {
        matches!(self.src.as_bytes()[offset], b'"' | b'\'' | b'`')
    }
}

/// Keywords after which a `/` starts a regular expression literal.
const REGEX_PRECEDING_KEYWORDS: [&str; 12] = [
    "return", "typeof", "case", "in", "of", "void", "delete", "throw", "new", "else", "do", "yield",
];

/// Whether a `/` following the byte at `last_significant` begins a regex
/// literal rather than a division.
fn regex_allowed(bytes: &[u8], last_significant: Option<usize>) -> bool {
    let Some(prev) = last_significant else { return true };
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$';
    match bytes[prev] {
        b'(' | b',' | b'=' | b':' | b'[' | b'!' | b'&' | b'|' | b'?' | b'{' | b'}' | b';' | b'+'
        | b'-' | b'*' | b'%' | b'<' | b'>' | b'~' | b'^' => true,
        b if is_ident(b) => {
            let start =
                bytes[..=prev].iter().rposition(|b| !is_ident(*b)).map(|p| p + 1).unwrap_or(0);
            let word = &bytes[start..=prev];
            REGEX_PRECEDING_KEYWORDS.iter().any(|k| k.as_bytes() == word)
        }
        _ => false,
    }
}

/// Offset of the `/` closing the regex literal opened at `open`, or `None`
/// when the line ends first.
fn regex_literal_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut in_class = false;
    let mut j = open + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 1,
            b'\n' | b'\r' => return None,
            b'[' => in_class = true,
            b']' => in_class = false,
            b'/' if !in_class => return (j > open + 1).then_some(j),
            _ => {}
        }
        j += 1;
    }
    None
}

/// Applies `re` only to code, leaving literal bodies and comments intact.
/// Returns the rewritten source and the number of replacements.
pub(crate) fn replace_in_code<F>(src: &str, re: &Regex, mut replacer: F) -> (String, usize)
where
    F: FnMut(&Captures<'_>) -> Option<String>,
{
    let map = CodeMap::new(src);
    let masked = map.masked();
    let mut out = String::with_capacity(src.len());
    let mut last = 0;
    let mut count = 0;
    for caps in re.captures_iter(&masked) {
        let Some(whole) = caps.get(0) else { continue };
        // Literal bodies are blanked in `masked`; a match spanning one would
        // read spaces, so only matches that are entirely code qualify.
        if !(whole.start()..whole.end()).all(|offset| map.is_code(offset)) {
            continue;
        }
        let Some(replacement) = replacer(&caps) else { continue };
        out.push_str(&src[last..whole.start()]);
        out.push_str(&replacement);
        last = whole.end();
        count += 1;
    }
    out.push_str(&src[last..]);
    (out, count)
}

pub(crate) fn replace_all_in_code<'s>(
    src: &'s str,
    re: &Regex,
    replacement: &str,
) -> (Cow<'s, str>, usize) {
    let (out, count) = replace_in_code(src, re, |caps| {
        let mut expanded = String::new();
        caps.expand(replacement, &mut expanded);
        Some(expanded)
    });
    if count == 0 {
        (Cow::Borrowed(src), 0)
    } else {
        (Cow::Owned(out), count)
    }
}

/// Interpreting a rendered case label: numeric literals become numbers, quoted
/// literals lose their quotes, anything else is kept verbatim.
pub(crate) fn literal_text(rendered: &str) -> LiteralText {
    let trimmed = rendered.trim();
    if let Some(n) = parse_number(trimmed) {
        return LiteralText::Number(n);
    }
    let quoted = trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')));
    if quoted {
        LiteralText::Text(trimmed[1..trimmed.len() - 1].to_string())
    } else {
        LiteralText::Text(trimmed.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LiteralText {
    Number(f64),
    Text(String),
}

pub(crate) fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    let negative = text.starts_with('-');
    let digits = text.trim_start_matches('-');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    digits.parse::<f64>().ok().map(|v| if negative { -v } else { v })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_labels() {
        assert_eq!(literal_text("12"), LiteralText::Number(12.0));
        assert_eq!(literal_text("0x1f"), LiteralText::Number(31.0));
        assert_eq!(literal_text("\"push\""), LiteralText::Text("push".into()));
        assert_eq!(literal_text("OP.ADD"), LiteralText::Text("OP.ADD".into()));
    }

    #[test]
    fn masks_strings_and_comments() {
        let src = r#"a = "b;c" + 'd\'e'; // tail"#;
        let map = CodeMap::new(src);
        let masked = map.masked();
        assert_eq!(masked.len(), src.len());
        assert!(!masked.contains("b;c"));
        assert!(!masked.contains("tail"));
        assert!(masked.starts_with("a = \""));
    }

    #[test]
    fn masks_regex_literals() {
        let src = "var ok = /'[/]/g.test(x); var s = '!0';";
        let map = CodeMap::new(src);
        let masked = map.masked();
        assert!(!masked.contains("'[/]"));
        assert!(masked.ends_with("var s = '  ';"), "{}", masked);
        assert_eq!(CodeMap::new("if (x) return /a'/;").masked(), "if (x) return /  /;");
    }

    #[test]
    fn division_is_not_a_regex() {
        let src = "a = b / c / d; e = (f) / 2 / 'g'";
        assert_eq!(CodeMap::new(src).masked(), "a = b / c / d; e = (f) / 2 / ' '");
    }

    #[test]
    fn keyword_offsets_skip_literals() {
        let src = "switch(a){} var s = 'switch'; /* switch */ xswitch; switch(b){}";
        let map = CodeMap::new(src);
        assert_eq!(map.keyword_offsets("switch"), vec![0, src.rfind("switch").unwrap()]);
    }

    #[test]
    fn matching_close_ignores_brackets_in_strings() {
        let src = r#"["]", "[", [1, 2]] + 1"#;
        let map = CodeMap::new(src);
        assert_eq!(map.matching_close(0), Some(src.find("] +").unwrap()));
    }

    #[test]
    fn replace_in_code_leaves_strings() {
        let re = Regex::new(r"0x([0-9a-f]+)").unwrap();
        let (out, count) = replace_all_in_code("x = 0x10 + '0x10'", &re, "hex_$1");
        assert_eq!(out, "x = hex_10 + '0x10'");
        assert_eq!(count, 1);
    }
}
