//! Deterministic JSON repair for common model output mistakes.
//!
//! A single scanner pass rewrites the text while tracking string and
//! bracket state, then `serde_json` decides whether the result is usable.

use serde_json::Value;

/// Attempt to repair malformed JSON without calling the model again.
///
/// Returns `None` when the input is already valid or cannot be repaired.
///
/// Fixes applied while scanning:
/// - `//` and `/* */` comments outside strings are dropped
/// - single-quoted strings become double-quoted
/// - raw newlines and tabs inside strings are escaped
/// - bare object keys are quoted
/// - Python `True`/`False`/`None` become JSON literals
/// - trailing commas before `}` or `]` are removed
/// - a truncated document gets its open string and brackets closed
pub fn repair_json(broken: &str) -> Option<String> {
    if serde_json::from_str::<Value>(broken).is_ok() {
        return None;
    }

    let chars: Vec<char> = broken.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(broken.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < len {
        let c = chars[i];

        if let Some(q) = quote {
            match c {
                '\\' => {
                    out.push(c);
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                        i += 1;
                    }
                }
                '"' if q == '\'' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ if c == q => {
                    out.push('"');
                    quote = None;
                }
                _ => out.push(c),
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push('"');
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < len && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(len);
                continue;
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                }
                out.push(c);
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < len && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < len && chars[j].is_whitespace() {
                    j += 1;
                }
                if chars.get(j) == Some(&':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(match word.as_str() {
                        "True" => "true",
                        "False" => "false",
                        "None" => "null",
                        other => other,
                    });
                }
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }

    if quote.is_some() {
        out.push('"');
    }
    if out.trim_end().ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = closers.pop() {
        drop_trailing_comma(&mut out);
        out.push(closer);
    }
    drop_trailing_comma(&mut out);

    serde_json::from_str::<Value>(&out).is_ok().then_some(out)
}

fn drop_trailing_comma(out: &mut String) {
    let kept = out.trim_end().len();
    if out[..kept].ends_with(',') {
        out.truncate(kept - 1);
    }
}
