// src/analysis/shape.rs
//! Declared response shapes and the tolerant JSON extraction applied to raw model text.
//!
//! Every stage owns a static `ResponseShape`. The client rejects a reply that does not
//! match it (missing field, wrong type, number outside its inclusive range), which is
//! what triggers the corrective re-prompt. Values are never clamped here.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Expected JSON type of a single field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Bool,
    Text,
    /// String or null.
    OptionalText,
    /// Number within the inclusive range `[min, max]`.
    Number { min: f64, max: f64 },
    /// Any finite number or null.
    OptionalNumber,
    TextList,
    /// Either an array of strings or a single string.
    TextOrTextList,
    /// String matching one of the labels (case-insensitive).
    OneOf(&'static [&'static str]),
    Object(&'static [FieldSpec]),
    Any,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Top-level shape of one stage's reply: always a JSON object.
#[derive(Debug, Clone, Copy)]
pub struct ResponseShape {
    pub fields: &'static [FieldSpec],
}

impl ResponseShape {
    pub const fn new(fields: &'static [FieldSpec]) -> Self {
        Self { fields }
    }

    /// Check `value` against the declared fields. The error string names the offending path.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("expected a JSON object, got {}", type_name(value)))?;
        validate_fields(obj, self.fields, "")
    }

    /// Remove optional fields that are explicitly `null`, recursing into declared objects,
    /// so decoding treats them exactly like absent fields. Call after `validate`.
    pub fn drop_null_optionals(&self, value: &mut Value) {
        if let Some(obj) = value.as_object_mut() {
            prune_fields(obj, self.fields);
        }
    }

    /// Short human-readable listing used in the corrective instruction.
    pub fn describe(&self) -> String {
        describe_fields(self.fields)
    }
}

fn validate_fields(obj: &Map<String, Value>, fields: &[FieldSpec], prefix: &str) -> Result<(), String> {
    for f in fields {
        let path = if prefix.is_empty() {
            f.name.to_string()
        } else {
            format!("{prefix}.{}", f.name)
        };
        match obj.get(f.name) {
            None => {
                if f.required {
                    return Err(format!("missing field `{path}`"));
                }
            }
            Some(Value::Null) if !f.required || accepts_null(f.kind) => {}
            Some(v) => validate_kind(v, f.kind, &path)?,
        }
    }
    Ok(())
}

fn prune_fields(obj: &mut Map<String, Value>, fields: &[FieldSpec]) {
    for f in fields {
        if !f.required && matches!(obj.get(f.name), Some(Value::Null)) {
            obj.remove(f.name);
            continue;
        }
        if let (FieldKind::Object(nested), Some(Value::Object(map))) = (f.kind, obj.get_mut(f.name)) {
            prune_fields(map, nested);
        }
    }
}

fn accepts_null(kind: FieldKind) -> bool {
    matches!(
        kind,
        FieldKind::OptionalText | FieldKind::OptionalNumber | FieldKind::Any
    )
}

fn validate_kind(v: &Value, kind: FieldKind, path: &str) -> Result<(), String> {
    let mismatch = |expected: &str| format!("field `{path}` should be {expected}, got {}", type_name(v));
    match kind {
        FieldKind::Bool => v.as_bool().map(|_| ()).ok_or_else(|| mismatch("a boolean")),
        FieldKind::Text | FieldKind::OptionalText => {
            v.as_str().map(|_| ()).ok_or_else(|| mismatch("a string"))
        }
        FieldKind::Number { min, max } => {
            let n = v.as_f64().ok_or_else(|| mismatch("a number"))?;
            if !n.is_finite() || n < min || n > max {
                return Err(format!("field `{path}` = {n} is outside [{min}, {max}]"));
            }
            Ok(())
        }
        FieldKind::OptionalNumber => match v.as_f64() {
            Some(n) if n.is_finite() => Ok(()),
            _ => Err(mismatch("a number or null")),
        },
        FieldKind::TextList => match v.as_array() {
            Some(items) if items.iter().all(Value::is_string) => Ok(()),
            _ => Err(mismatch("an array of strings")),
        },
        FieldKind::TextOrTextList => match v {
            Value::String(_) => Ok(()),
            Value::Array(items) if items.iter().all(Value::is_string) => Ok(()),
            _ => Err(mismatch("a string or an array of strings")),
        },
        FieldKind::OneOf(labels) => {
            let s = v.as_str().ok_or_else(|| mismatch("a string"))?;
            let s = s.trim();
            if labels.iter().any(|l| l.eq_ignore_ascii_case(s)) {
                Ok(())
            } else {
                Err(format!(
                    "field `{path}` = {s:?} is not one of [{}]",
                    labels.join(", ")
                ))
            }
        }
        FieldKind::Object(fields) => {
            let obj = v.as_object().ok_or_else(|| mismatch("an object"))?;
            validate_fields(obj, fields, path)
        }
        FieldKind::Any => Ok(()),
    }
}

fn describe_fields(fields: &[FieldSpec]) -> String {
    fields
        .iter()
        .map(|f| {
            let kind = match f.kind {
                FieldKind::Bool => "boolean".to_string(),
                FieldKind::Text => "string".to_string(),
                FieldKind::OptionalText => "string|null".to_string(),
                FieldKind::Number { min, max } => format!("number in [{min}, {max}]"),
                FieldKind::OptionalNumber => "number|null".to_string(),
                FieldKind::TextList => "string[]".to_string(),
                FieldKind::TextOrTextList => "string[]".to_string(),
                FieldKind::OneOf(labels) => labels.join("|"),
                FieldKind::Object(inner) => format!("{{{}}}", describe_fields(inner)),
                FieldKind::Any => "any".to_string(),
            };
            let opt = if f.required { "" } else { "?" };
            format!("{}{opt}: {kind}", f.name)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ------------------------------------------------------------
// Tolerant extraction
// ------------------------------------------------------------

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)\s*```").expect("valid fence regex"));

/// Pull a JSON object out of raw model text.
///
/// Tried in order: the whole text, the first fenced code block, the outermost `{...}` span.
pub fn extract_json(raw: &str) -> Result<Value, String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err("empty response".to_string());
    }
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Ok(v);
    }
    if let Some(cap) = RE_FENCED.captures(text) {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&cap[1]) {
            return Ok(v);
        }
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Ok(v);
            }
        }
    }
    Err("no JSON object found in response".to_string())
}
