//! # Schema validation
//!
//! Every stage declares the shape of the document it expects back as a
//! [`Shape`]: an explicit tagged schema with required and optional fields,
//! minimum list sizes, and bounded numeric ranges. [`validate`] extracts the
//! JSON payload from a raw response (repairing it when needed) and checks it
//! against that shape, collecting every violation into a [`ValidationError`]
//! whose text can be sent back to the model verbatim.
//!
//! Out-of-range values are violations. Nothing is clamped or coerced.

pub mod extract;
pub mod repair;

pub use extract::{extract_json, strip_reasoning, Extracted};
pub use repair::repair_json;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Issues beyond this count are summarized rather than listed.
const MAX_LISTED_ISSUES: usize = 12;

/// Whole floats at or beyond this magnitude do not fit an `i64` exactly.
const WHOLE_FLOAT_LIMIT: f64 = 9.0e18;

/// Expected shape of a JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Object {
        fields: Vec<Field>,
    },
    Array {
        items: Box<Shape>,
        #[serde(default)]
        min_items: usize,
        #[serde(default)]
        max_items: Option<usize>,
    },
    Text {
        #[serde(default = "default_true")]
        non_empty: bool,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Number {
        min: Option<f64>,
        max: Option<f64>,
    },
    Boolean,
    /// A string that must be one of `values` (case-insensitive).
    OneOf {
        values: Vec<String>,
    },
    Any,
}

/// A named member of an [`Shape::Object`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub shape: Shape,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl Field {
    pub fn required(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: false,
        }
    }
}

impl Shape {
    pub fn object(fields: Vec<Field>) -> Self {
        Shape::Object { fields }
    }

    /// An array that must hold at least `min_items` elements.
    pub fn list(items: Shape, min_items: usize) -> Self {
        Shape::Array {
            items: Box::new(items),
            min_items,
            max_items: None,
        }
    }

    /// Non-empty text.
    pub fn text() -> Self {
        Shape::Text { non_empty: true }
    }

    pub fn integer(min: i64, max: i64) -> Self {
        Shape::Integer {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn number(min: f64, max: f64) -> Self {
        Shape::Number {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Shape::OneOf {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Look up a direct field of an object shape.
    pub fn field(&self, name: &str) -> Option<&Field> {
        match self {
            Shape::Object { fields } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// An illustrative JSON skeleton, suitable for embedding in a prompt.
    pub fn skeleton(&self) -> Value {
        match self {
            Shape::Object { fields } => {
                let mut map = Map::new();
                for field in fields {
                    map.insert(field.name.clone(), field.shape.skeleton());
                }
                Value::Object(map)
            }
            Shape::Array { items, .. } => json!([items.skeleton()]),
            Shape::Text { .. } => json!("<text>"),
            Shape::Integer { min, max } => json!(format!("<integer{}>", range_hint(min, max))),
            Shape::Number { min, max } => json!(format!("<number{}>", range_hint(min, max))),
            Shape::Boolean => json!("<true|false>"),
            Shape::OneOf { values } => json!(format!("<{}>", values.join("|"))),
            Shape::Any => json!("<any>"),
        }
    }
}

fn range_hint<T: fmt::Display>(min: &Option<T>, max: &Option<T>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!(" {}-{}", lo, hi),
        (Some(lo), None) => format!(" >= {}", lo),
        (None, Some(hi)) => format!(" <= {}", hi),
        (None, None) => String::new(),
    }
}

/// One schema violation at a JSON path such as `$.pains[2].severity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    /// No JSON document could be found, even after repair.
    Unparseable,
    /// A document was found but does not match the expected shape.
    SchemaMismatch,
}

/// Why a response failed validation.
///
/// `Display` renders a description intended to be quoted back to the
/// model in a repair request.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{}", self.describe())]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub issues: Vec<Issue>,
}

impl ValidationError {
    fn unparseable(raw: &str) -> Self {
        let snippet: String = raw.trim().chars().take(120).collect();
        Self {
            kind: ValidationErrorKind::Unparseable,
            issues: vec![Issue {
                path: "$".to_string(),
                message: if snippet.is_empty() {
                    "response was empty".to_string()
                } else {
                    format!("no JSON document found in response starting with {:?}", snippet)
                },
            }],
        }
    }

    pub fn describe(&self) -> String {
        match self.kind {
            ValidationErrorKind::Unparseable => {
                let detail = self.issues.first().map(|i| i.message.as_str()).unwrap_or("");
                format!("the response could not be parsed as JSON: {}", detail)
            }
            ValidationErrorKind::SchemaMismatch => {
                let mut lines = vec![format!(
                    "the JSON does not match the required structure ({} problem{}):",
                    self.issues.len(),
                    if self.issues.len() == 1 { "" } else { "s" }
                )];
                for issue in self.issues.iter().take(MAX_LISTED_ISSUES) {
                    lines.push(format!("- {}: {}", issue.path, issue.message));
                }
                if self.issues.len() > MAX_LISTED_ISSUES {
                    lines.push(format!(
                        "- ... and {} more",
                        self.issues.len() - MAX_LISTED_ISSUES
                    ));
                }
                lines.join("\n")
            }
        }
    }
}

/// A response that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOutput {
    pub value: Value,
    pub repaired: bool,
}

/// Extract the JSON payload from `raw` and check it against `shape`.
///
/// # Example
///
/// ```
/// use resonance_pipeline::schema::{validate, Field, Shape};
///
/// let shape = Shape::object(vec![Field::required("severity", Shape::integer(1, 10))]);
/// assert!(validate("Result: {\"severity\": 7}", &shape).is_ok());
/// assert!(validate("{\"severity\": 11}", &shape).is_err());
/// ```
pub fn validate(raw: &str, shape: &Shape) -> Result<ValidatedOutput, ValidationError> {
    let Extracted { value, repaired } =
        extract_json(raw).ok_or_else(|| ValidationError::unparseable(raw))?;

    let mut issues = Vec::new();
    check(&value, shape, "$", &mut issues);
    if issues.is_empty() {
        Ok(ValidatedOutput { value, repaired })
    } else {
        Err(ValidationError {
            kind: ValidationErrorKind::SchemaMismatch,
            issues,
        })
    }
}

fn check(value: &Value, shape: &Shape, path: &str, issues: &mut Vec<Issue>) {
    let mut fail = |message: String| {
        issues.push(Issue {
            path: path.to_string(),
            message,
        })
    };

    match shape {
        Shape::Any => {}
        Shape::Object { fields } => {
            let Some(map) = value.as_object() else {
                return fail(format!("expected an object, found {}", type_name(value)));
            };
            for field in fields {
                let child = format!("{}.{}", path, field.name);
                match map.get(&field.name) {
                    None | Some(Value::Null) if field.required => issues.push(Issue {
                        path: child,
                        message: "required field is missing".to_string(),
                    }),
                    None | Some(Value::Null) => {}
                    Some(v) => check(v, &field.shape, &child, issues),
                }
            }
        }
        Shape::Array {
            items,
            min_items,
            max_items,
        } => {
            let Some(list) = value.as_array() else {
                return fail(format!("expected an array, found {}", type_name(value)));
            };
            if list.len() < *min_items {
                fail(format!(
                    "expected at least {} item(s), found {}",
                    min_items,
                    list.len()
                ));
            }
            if let Some(max) = max_items.filter(|max| list.len() > *max) {
                fail(format!("expected at most {} item(s), found {}", max, list.len()));
            }
            for (i, item) in list.iter().enumerate() {
                check(item, items, &format!("{}[{}]", path, i), issues);
            }
        }
        Shape::Text { non_empty } => match value.as_str() {
            None => fail(format!("expected text, found {}", type_name(value))),
            Some(s) if *non_empty && s.trim().is_empty() => {
                fail("text must not be empty".to_string())
            }
            Some(_) => {}
        },
        Shape::Integer { min, max } => {
            let whole = value.as_f64().is_some_and(|f| f.fract() == 0.0);
            let n = value.as_i64().or_else(|| {
                value
                    .as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < WHOLE_FLOAT_LIMIT)
                    .map(|f| f as i64)
            });
            let in_range =
                |n: i64| !(min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi));
            match n {
                Some(n) if in_range(n) => {}
                Some(_) => fail(format!(
                    "{} is outside the range{}",
                    describe_value(value),
                    range_hint(min, max)
                )),
                None if whole => fail(format!(
                    "{} does not fit a 64-bit integer",
                    describe_value(value)
                )),
                None => fail(format!("expected an integer, found {}", describe_value(value))),
            }
        }
        Shape::Number { min, max } => match value.as_f64() {
            None => fail(format!("expected a number, found {}", describe_value(value))),
            Some(n) => {
                if min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi) {
                    fail(format!("{} is outside the range{}", n, range_hint(min, max)));
                }
            }
        },
        Shape::Boolean => {
            if !value.is_boolean() {
                fail(format!("expected true or false, found {}", describe_value(value)));
            }
        }
        Shape::OneOf { values } => match value.as_str() {
            Some(s) if values.iter().any(|v| v.eq_ignore_ascii_case(s.trim())) => {}
            _ => fail(format!(
                "expected one of [{}], found {}",
                values.join(", "),
                describe_value(value)
            )),
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "text",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => type_name(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn taxonomy() -> Shape {
        let pain = Shape::object(vec![
            Field::required("pain", Shape::text()),
            Field::required("severity", Shape::integer(1, 10)),
            Field::optional("evidence", Shape::text()),
        ]);
        Shape::object(vec![
            Field::required("functional_pains", Shape::list(pain.clone(), 1)),
            Field::required("financial_pains", Shape::list(pain.clone(), 1)),
            Field::required("emotional_pains", Shape::list(pain, 1)),
        ])
    }

    #[test]
    fn test_valid_taxonomy_in_fence() {
        let raw = r#"```json
{"functional_pains": [{"pain": "manual invoicing", "severity": 7}],
 "financial_pains": [{"pain": "late payments", "severity": 9, "evidence": null}],
 "emotional_pains": [{"pain": "stress", "severity": 5}]}
```"#;
        let out = validate(raw, &taxonomy()).unwrap();
        assert!(!out.repaired);
        assert_eq!(out.value["financial_pains"][0]["severity"], 9);
    }

    #[test]
    fn test_empty_category_and_out_of_range_are_both_reported() {
        let raw = r#"{"functional_pains": [],
 "financial_pains": [{"pain": "late payments", "severity": 12}],
 "emotional_pains": [{"pain": "", "severity": 0}]}"#;
        let err = validate(raw, &taxonomy()).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::SchemaMismatch);
        let paths: Vec<&str> = err.issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "$.functional_pains",
                "$.financial_pains[0].severity",
                "$.emotional_pains[0].pain",
                "$.emotional_pains[0].severity",
            ]
        );
        let text = err.to_string();
        assert!(text.contains("12 is outside the range 1-10"), "{}", text);
        assert!(text.contains("expected at least 1 item(s), found 0"), "{}", text);
    }

    #[test]
    fn test_missing_required_field() {
        let raw = r#"{"functional_pains": [{"pain": "x", "severity": 3}], "financial_pains": [{"pain": "y", "severity": 3}]}"#;
        let err = validate(raw, &taxonomy()).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].path, "$.emotional_pains");
        assert_eq!(err.issues[0].message, "required field is missing");
    }

    #[test]
    fn test_string_number_is_not_coerced() {
        let shape = Shape::object(vec![Field::required("fit_score", Shape::number(0.0, 100.0))]);
        let err = validate(r#"{"fit_score": "85"}"#, &shape).unwrap_err();
        assert!(err.issues[0].message.contains("expected a number"));
        assert!(validate(r#"{"fit_score": 85.5}"#, &shape).is_ok());
    }

    #[test]
    fn test_integer_accepts_whole_floats_only() {
        let shape = Shape::object(vec![Field::required("n", Shape::integer(1, 10))]);
        assert!(validate(r#"{"n": 4.0}"#, &shape).is_ok());
        assert!(validate(r#"{"n": 4.5}"#, &shape).is_err());
    }

    #[test]
    fn test_huge_whole_float_is_reported_as_sent() {
        let shape = Shape::object(vec![Field::required("severity", Shape::integer(1, 10))]);
        let err = validate(r#"{"severity": 1e30}"#, &shape).unwrap_err();
        let message = &err.issues[0].message;
        assert!(!message.contains("9223372036854775807"), "{}", message);
        assert!(message.contains("does not fit a 64-bit integer"), "{}", message);

        let err = validate(r#"{"severity": 18446744073709551615}"#, &shape).unwrap_err();
        assert_eq!(
            err.issues[0].message,
            "18446744073709551615 does not fit a 64-bit integer"
        );

        let err = validate(r#"{"severity": 12.0}"#, &shape).unwrap_err();
        assert_eq!(err.issues[0].message, "12.0 is outside the range 1-10");
    }

    #[test]
    fn test_one_of_is_case_insensitive() {
        let shape = Shape::object(vec![Field::required(
            "stage",
            Shape::one_of(["awareness", "decision"]),
        )]);
        assert!(validate(r#"{"stage": "Awareness"}"#, &shape).is_ok());
        assert!(validate(r#"{"stage": "retention"}"#, &shape).is_err());
    }

    #[test]
    fn test_repaired_payload_is_flagged() {
        let shape = Shape::object(vec![Field::required("name", Shape::text())]);
        let out = validate("{'name': 'Acme',}", &shape).unwrap();
        assert!(out.repaired);
    }

    #[test]
    fn test_unparseable_description_quotes_the_start() {
        let err = validate("I cannot help with that.", &Shape::Any).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::Unparseable);
        assert!(err.to_string().contains("I cannot help"));
    }

    #[test]
    fn test_long_issue_lists_are_summarized() {
        let shape = Shape::list(Shape::integer(0, 1), 0);
        let raw = serde_json::to_string(&vec![5; 20]).unwrap();
        let err = validate(&raw, &shape).unwrap_err();
        assert_eq!(err.issues.len(), 20);
        assert!(err.to_string().ends_with("- ... and 8 more"));
    }

    #[test]
    fn test_skeleton_shows_ranges() {
        let shape = Shape::object(vec![
            Field::required("severity", Shape::integer(1, 10)),
            Field::required("tags", Shape::list(Shape::text(), 1)),
        ]);
        assert_eq!(
            shape.skeleton(),
            json!({"severity": "<integer 1-10>", "tags": ["<text>"]})
        );
    }

    #[test]
    fn test_shape_round_trips_through_config_json() {
        let text = r#"{"type": "object", "fields": [
            {"name": "score", "shape": {"type": "integer", "min": 0, "max": 100}},
            {"name": "note", "shape": {"type": "text"}, "required": false}
        ]}"#;
        let shape: Shape = serde_json::from_str(text).unwrap();
        assert_eq!(
            shape,
            Shape::object(vec![
                Field::required("score", Shape::integer(0, 100)),
                Field::optional("note", Shape::text()),
            ])
        );
    }
}
