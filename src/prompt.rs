//! Prompt templating.
//!
//! Templates use `{name}` placeholders filled from [`PromptVars`]. Write
//! `{{` or `}}` for a literal brace. Placeholders with no matching variable
//! are left in place so a typo shows up in the rendered prompt instead of
//! silently disappearing.

use serde::Serialize;
use std::collections::BTreeMap;

/// Named values substituted into a stage's prompt template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptVars {
    values: BTreeMap<String, String>,
}

impl PromptVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Insert a serializable value as pretty-printed JSON.
    pub fn insert_json<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) -> &mut Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string());
        self.insert(key, text)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

/// Render `template`, replacing `{name}` with the matching variable.
///
/// # Example
///
/// ```
/// use resonance_pipeline::prompt::{render, PromptVars};
///
/// let mut vars = PromptVars::new();
/// vars.insert("entity_name", "Solo founders");
/// let out = render("Segment: {entity_name}. Reply as {{\"ok\": true}}", &vars);
/// assert_eq!(out, r#"Segment: Solo founders. Reply as {"ok": true}"#);
/// ```
pub fn render(template: &str, vars: &PromptVars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        match tail[1..].find('}') {
            Some(end) if is_identifier(&tail[1..=end]) => {
                let name = &tail[1..=end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&tail[..end + 2]),
                }
                rest = &tail[end + 2..];
            }
            _ => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Wrap text in a labeled section for structured prompts.
pub fn section(label: &str, content: &str) -> String {
    format!("## {}\n{}", label, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> PromptVars {
        let mut v = PromptVars::new();
        for (k, val) in pairs {
            v.insert(*k, *val);
        }
        v
    }

    #[test]
    fn test_render_basic() {
        let v = vars(&[("business_name", "Acme"), ("segment_count", "3")]);
        assert_eq!(
            render("Find {segment_count} segments for {business_name}.", &v),
            "Find 3 segments for Acme."
        );
    }

    #[test]
    fn test_unknown_placeholder_left_in_place() {
        assert_eq!(render("Hello {nobody}", &PromptVars::new()), "Hello {nobody}");
    }

    #[test]
    fn test_escaped_braces() {
        let v = vars(&[("x", "1")]);
        assert_eq!(
            render("{{\"result\": {{\"value\": {x}}}}}", &v),
            r#"{"result": {"value": 1}}"#
        );
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let v = vars(&[("a", "{b}"), ("b", "nope")]);
        assert_eq!(render("{a}", &v), "{b}");
    }

    #[test]
    fn test_lone_and_non_identifier_braces_pass_through() {
        let v = vars(&[("x", "1")]);
        assert_eq!(render("{ not a var } {x} }", &v), "{ not a var } 1 }");
    }

    #[test]
    fn test_insert_json_pretty_prints() {
        let mut v = PromptVars::new();
        v.insert_json("entity", &serde_json::json!({"name": "SMB"}));
        assert_eq!(v.get("entity"), Some("{\n  \"name\": \"SMB\"\n}"));
    }

    #[test]
    fn test_section() {
        assert_eq!(section("Context", "Some knowledge"), "## Context\nSome knowledge");
    }
}
