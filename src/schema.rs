//! Schema validation for raw stage output.
//!
//! Every stage must produce a single JSON object. Models wrap that object in
//! prose, code fences, or both, so extraction tries an ordered sequence of
//! strategies until one yields parseable JSON:
//!
//! 1. Parse the whole text as JSON
//! 2. Parse the contents of each fenced code block
//! 3. Parse the first balanced `{...}` span
//!
//! The order is part of the tested contract. After extraction, the stage's
//! declared field contract is checked: required fields present with the right
//! shape, score fields within `[0, 100]`, enum fields within the declared
//! value set. A stage-declared `{"error": {...}}` payload is an explicit
//! stage failure, distinct from a parse failure, and is never coerced into a
//! default artifact.

use crate::artifact::Stage;
use crate::errors::{SchemaError, StageError};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::LazyLock;

static FENCED_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());

/// The shape a field must have.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// A string.
    Text,
    /// A boolean.
    Flag,
    /// An integer in `[0, 100]`.
    Score,
    /// An array of strings.
    TextList,
    /// An array of objects.
    ObjectList,
    /// A string drawn from a fixed value set.
    Choice(&'static [&'static str]),
}

/// One required field in a stage's output contract.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// A stage's required-field contract.
#[derive(Debug, Clone, Copy)]
pub struct StageSchema {
    pub stage: Stage,
    pub required: &'static [FieldSpec],
}

pub const DECISION_VALUES: &[&str] =
    &["pass", "revise", "stop_data_needed", "stop_unfixable_truth"];

pub const RESEARCHER_SCHEMA: StageSchema = StageSchema {
    stage: Stage::Researcher,
    required: &[
        FieldSpec { name: "target_role", kind: FieldKind::Text },
        FieldSpec { name: "required_sections", kind: FieldKind::TextList },
        FieldSpec { name: "keyword_clusters", kind: FieldKind::ObjectList },
        FieldSpec { name: "formatting_rules", kind: FieldKind::ObjectList },
    ],
};

pub const WRITER_SCHEMA: StageSchema = StageSchema {
    stage: Stage::Writer,
    required: &[
        FieldSpec { name: "plain_text", kind: FieldKind::Text },
        FieldSpec { name: "rich_text", kind: FieldKind::Text },
        FieldSpec { name: "change_log", kind: FieldKind::TextList },
    ],
};

pub const CRITIC_SCHEMA: StageSchema = StageSchema {
    stage: Stage::Critic,
    required: &[
        FieldSpec { name: "overall", kind: FieldKind::Score },
        FieldSpec { name: "truthfulness", kind: FieldKind::Score },
        FieldSpec { name: "domain_compliance", kind: FieldKind::Score },
        FieldSpec { name: "alignment", kind: FieldKind::Score },
        FieldSpec { name: "clarity", kind: FieldKind::Score },
        FieldSpec { name: "keyword_coverage", kind: FieldKind::Score },
        FieldSpec { name: "decision", kind: FieldKind::Choice(DECISION_VALUES) },
    ],
};

pub const GATEKEEPER_SCHEMA: StageSchema = StageSchema {
    stage: Stage::Gatekeeper,
    required: &[
        FieldSpec { name: "complete", kind: FieldKind::Flag },
        FieldSpec { name: "continue", kind: FieldKind::Flag },
    ],
};

/// Outcome of parsing a stage's raw output.
#[derive(Debug)]
pub enum StageParseError {
    /// Extraction or validation failed; eligible for a bounded retry.
    Schema(SchemaError),
    /// The stage declared an explicit error payload; never retried.
    Declared(StageError),
}

/// Extract a JSON object from arbitrary model text.
///
/// Tries each strategy in order and returns the first object that parses.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    // Strategy 1: the whole text is JSON
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // Strategy 2: fenced code block contents
    for cap in FENCED_BLOCK_REGEX.captures_iter(trimmed) {
        if let Some(block) = cap.get(1)
            && let Ok(value @ Value::Object(_)) =
                serde_json::from_str::<Value>(block.as_str().trim())
        {
            return Some(value);
        }
    }

    // Strategy 3: first balanced {...} span
    if let Some(span) = balanced_object_span(trimmed)
        && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(span)
    {
        return Some(value);
    }

    None
}

/// Find the first balanced `{...}` span, respecting string literals and
/// escape sequences.
fn balanced_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Check a parsed object for a stage-declared `{"error": {...}}` payload.
fn check_declared_error(value: &Value, stage: Stage) -> Result<(), StageError> {
    if let Some(error) = value.get("error")
        && error.is_object()
    {
        let code = error
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("stage_error")
            .to_string();
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| error.to_string());
        return Err(StageError { stage, code, message });
    }
    Ok(())
}

/// Validate a parsed object against a stage schema.
pub fn validate(value: &Value, schema: &StageSchema) -> Result<(), SchemaError> {
    let object = value
        .as_object()
        .ok_or_else(|| SchemaError::new(schema.stage, "output is not a JSON object"))?;

    for field in schema.required {
        let Some(found) = object.get(field.name) else {
            return Err(SchemaError::new(
                schema.stage,
                format!("missing required field '{}'", field.name),
            ));
        };

        match field.kind {
            FieldKind::Text => {
                if !found.is_string() {
                    return Err(type_error(schema.stage, field.name, "a string"));
                }
            }
            FieldKind::Flag => {
                if !found.is_boolean() {
                    return Err(type_error(schema.stage, field.name, "a boolean"));
                }
            }
            FieldKind::Score => match found.as_u64() {
                Some(n) if n <= 100 => {}
                Some(n) => {
                    return Err(SchemaError::new(
                        schema.stage,
                        format!("score field '{}' is {} but must be within [0, 100]", field.name, n),
                    ));
                }
                None => {
                    return Err(type_error(schema.stage, field.name, "an integer in [0, 100]"));
                }
            },
            FieldKind::TextList => {
                let ok = found
                    .as_array()
                    .is_some_and(|items| items.iter().all(|i| i.is_string()));
                if !ok {
                    return Err(type_error(schema.stage, field.name, "an array of strings"));
                }
            }
            FieldKind::ObjectList => {
                let ok = found
                    .as_array()
                    .is_some_and(|items| items.iter().all(|i| i.is_object()));
                if !ok {
                    return Err(type_error(schema.stage, field.name, "an array of objects"));
                }
            }
            FieldKind::Choice(values) => match found.as_str() {
                Some(s) if values.contains(&s) => {}
                Some(s) => {
                    return Err(SchemaError::new(
                        schema.stage,
                        format!(
                            "field '{}' has value '{}' but must be one of: {}",
                            field.name,
                            s,
                            values.join(", ")
                        ),
                    ));
                }
                None => {
                    return Err(type_error(schema.stage, field.name, "a string"));
                }
            },
        }
    }

    Ok(())
}

fn type_error(stage: Stage, field: &str, expected: &str) -> SchemaError {
    SchemaError::new(stage, format!("field '{}' must be {}", field, expected))
}

/// Extract, check for declared errors, validate, and deserialize a stage
/// artifact in one pass.
pub fn parse_stage<T: DeserializeOwned>(
    raw: &str,
    schema: &StageSchema,
) -> Result<T, StageParseError> {
    let value = extract_json(raw).ok_or_else(|| {
        StageParseError::Schema(SchemaError::new(
            schema.stage,
            "no JSON object found in stage output",
        ))
    })?;

    check_declared_error(&value, schema.stage).map_err(StageParseError::Declared)?;
    validate(&value, schema).map_err(StageParseError::Schema)?;

    serde_json::from_value(value).map_err(|e| {
        StageParseError::Schema(SchemaError::new(
            schema.stage,
            format!("validated output did not deserialize: {}", e),
        ))
    })
}
