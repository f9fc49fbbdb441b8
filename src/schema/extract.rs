//! Locating the structured payload inside a model response.
//!
//! Responses are expected to hold one JSON document, but models wrap it in
//! reasoning blocks, markdown fences, or prose. Candidates are tried
//! strictly first, then through [`repair_json`].

use super::repair::repair_json;
use serde_json::Value;

/// A JSON document pulled out of raw response text.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    /// Whether lenient repair was needed to parse it.
    pub repaired: bool,
}

/// Extract the JSON payload from `raw`, or `None` if no candidate parses.
pub fn extract_json(raw: &str) -> Option<Extracted> {
    let cleaned = strip_reasoning(raw);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    let candidates = candidates(cleaned);

    for candidate in &candidates {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() || value.is_array() {
                return Some(Extracted { value, repaired: false });
            }
        }
    }

    candidates.iter().find_map(|candidate| {
        let fixed = repair_json(candidate)?;
        let value = serde_json::from_str::<Value>(&fixed).ok()?;
        (value.is_object() || value.is_array()).then_some(Extracted { value, repaired: true })
    })
}

/// Candidate substrings in priority order, de-duplicated.
fn candidates(text: &str) -> Vec<&str> {
    fn push<'a>(out: &mut Vec<&'a str>, candidate: Option<&'a str>) {
        if let Some(c) = candidate.map(str::trim).filter(|c| !c.is_empty()) {
            if !out.contains(&c) {
                out.push(c);
            }
        }
    }

    let mut out = Vec::new();
    push(&mut out, Some(text));
    push(&mut out, fenced_block(text));
    push(&mut out, largest_bracketed(text, '{', '}'));
    push(&mut out, largest_bracketed(text, '[', ']'));
    // An unterminated document runs from its first opener to the end.
    push(&mut out, text.find('{').map(|start| &text[start..]));
    out
}

/// Remove `<think>`/`<thinking>` blocks. An unclosed block swallows the rest.
pub fn strip_reasoning(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        while let Some(start) = out.find(open) {
            match out[start..].find(close) {
                Some(offset) => out.replace_range(start..start + offset + close.len(), ""),
                None => out.truncate(start),
            }
        }
    }
    out
}

/// Content of the first fenced code block, preferring one tagged `json`.
fn fenced_block(text: &str) -> Option<&str> {
    let mut first: Option<&str> = None;
    let mut rest = 0;
    while let Some(open) = text[rest..].find("```") {
        let after = rest + open + 3;
        let line_end = after + text[after..].find('\n')?;
        let body_start = line_end + 1;
        let close = body_start + text[body_start..].find("```")?;
        let lang = text[after..line_end].trim();
        let body = &text[body_start..close];
        if lang.eq_ignore_ascii_case("json") {
            return Some(body);
        }
        first.get_or_insert(body);
        rest = close + 3;
    }
    first
}

/// The longest balanced `open..close` region, ignoring delimiters in strings.
/// Ties go to the later region.
fn largest_bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let mut best: Option<&str> = None;
    let mut from = 0;

    while let Some(offset) = text[from..].find(open) {
        let start = from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (i, ch) in text[start..].char_indices() {
            if escaped {
                escaped = false;
            } else if in_string {
                match ch {
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
            } else if ch == '"' {
                in_string = true;
            } else if ch == open {
                depth += 1;
            } else if ch == close {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i);
                    break;
                }
            }
        }

        let Some(end) = end else { break };
        let region = &text[start..=end];
        if best.map_or(true, |b| region.len() >= b.len()) {
            best = Some(region);
        }
        from = end + 1;
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_document() {
        let got = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(got.value, json!({"a": 1}));
        assert!(!got.repaired);
    }

    #[test]
    fn test_reasoning_then_fence() {
        let raw = "<think>let me see {draft}</think>\nHere you go:\n```json\n{\"segments\": []}\n```\nThanks";
        assert_eq!(extract_json(raw).unwrap().value, json!({"segments": []}));
    }

    #[test]
    fn test_unclosed_reasoning_block_is_dropped() {
        assert_eq!(strip_reasoning("answer<thinking>never closed"), "answer");
    }

    #[test]
    fn test_prose_with_small_and_large_objects() {
        let raw = r#"Fill in {name}. Result: {"name": "Acme", "tags": ["x"]} done"#;
        assert_eq!(
            extract_json(raw).unwrap().value,
            json!({"name": "Acme", "tags": ["x"]})
        );
    }

    #[test]
    fn test_bracket_in_string_does_not_confuse_scan() {
        let raw = r#"note: {"text": "a } b", "n": 2}"#;
        assert_eq!(extract_json(raw).unwrap().value["n"], 2);
    }

    #[test]
    fn test_truncated_document_in_prose_is_repaired() {
        let raw = "Sure! {\"pains\": [{\"pain\": \"cash flow\", \"severity\": 8}";
        let got = extract_json(raw).unwrap();
        assert!(got.repaired);
        assert_eq!(got.value["pains"][0]["severity"], 8);
    }

    #[test]
    fn test_scalars_are_not_payloads() {
        assert!(extract_json("42").is_none());
        assert!(extract_json("   ").is_none());
        assert!(extract_json("no json here at all").is_none());
    }
}
