//! Declared input shapes for capabilities and the validation that guards them.
//!
//! Shapes are a JSON-Schema subset: `type` (single or list), `enum`,
//! `properties`, `required`, `additionalProperties: false`, `items`,
//! `minimum`/`maximum` and `minLength`/`maxLength`. Unknown keywords are
//! ignored. A [`ValidatedInput`] can only be produced by [`InputShape::validate`],
//! which is what makes invoking a capability on unchecked input unrepresentable.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The declared shape of a capability's input, exposed to the model verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputShape(Value);

impl InputShape {
    /// Wrap an existing JSON-Schema document.
    pub fn from_schema(schema: Value) -> Self {
        Self(schema)
    }

    /// An object shape with no declared properties.
    pub fn empty_object() -> Self {
        Self(serde_json::json!({"type": "object", "properties": {}}))
    }

    /// Start building an object shape.
    pub fn object() -> ShapeBuilder {
        ShapeBuilder::default()
    }

    pub fn schema(&self) -> &Value {
        &self.0
    }

    pub fn validate(&self, input: &Value) -> Result<ValidatedInput, ValidationErrors> {
        let mut errors = Vec::new();
        check(&self.0, input, "$", &mut errors);
        if errors.is_empty() {
            Ok(ValidatedInput {
                value: input.clone(),
            })
        } else {
            Err(ValidationErrors { errors })
        }
    }
}

/// Fluent builder for object shapes.
///
/// ```ignore
/// InputShape::object()
///     .required("a", json!({"type": "number"}))
///     .property("note", json!({"type": "string"}))
///     .deny_additional()
///     .build()
/// ```
#[derive(Default)]
pub struct ShapeBuilder {
    properties: Map<String, Value>,
    required: Vec<String>,
    deny_additional: bool,
}

impl ShapeBuilder {
    pub fn property(mut self, name: &str, schema: Value) -> Self {
        let _ = self.properties.insert(name.into(), schema);
        self
    }

    pub fn required(mut self, name: &str, schema: Value) -> Self {
        let _ = self.properties.insert(name.into(), schema);
        self.required.push(name.into());
        self
    }

    pub fn deny_additional(mut self) -> Self {
        self.deny_additional = true;
        self
    }

    pub fn build(self) -> InputShape {
        let mut schema = Map::new();
        let _ = schema.insert("type".into(), Value::String("object".into()));
        let _ = schema.insert("properties".into(), Value::Object(self.properties));
        if !self.required.is_empty() {
            let _ = schema.insert(
                "required".into(),
                Value::Array(self.required.into_iter().map(Value::String).collect()),
            );
        }
        if self.deny_additional {
            let _ = schema.insert("additionalProperties".into(), Value::Bool(false));
        }
        InputShape(Value::Object(schema))
    }
}

/// Input that passed its shape check.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedInput {
    value: Value,
}

impl ValidatedInput {
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn into_inner(self) -> Value {
        self.value
    }
}

/// A single shape violation, addressed by JSON path (`$.items[2].name`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError {
                path: path.into(),
                message: message.into(),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.path, e.message))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            push(errors, path, format!("value {value} is not one of the allowed values"));
            return;
        }
    }

    if let Some(expected) = schema.get("type") {
        let names: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !names.is_empty() && !names.iter().any(|n| matches_type(n, value)) {
            push(
                errors,
                path,
                format!("expected {}, got {}", names.join(" or "), type_name(value)),
            );
            return;
        }
    }

    match value {
        Value::Number(n) => {
            let v = n.as_f64().unwrap_or_default();
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if v < min {
                    push(errors, path, format!("must be >= {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if v > max {
                    push(errors, path, format!("must be <= {max}"));
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    push(errors, path, format!("must be at least {min} characters"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    push(errors, path, format!("must be at most {max} characters"));
                }
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for name in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(name) {
                        push(errors, &format!("{path}.{name}"), "missing required property");
                    }
                }
            }
            let properties = schema.get("properties").and_then(Value::as_object);
            for (key, child) in map {
                match properties.and_then(|p| p.get(key)) {
                    Some(child_schema) => check(child_schema, child, &format!("{path}.{key}"), errors),
                    None => {
                        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                            push(errors, &format!("{path}.{key}"), "unexpected property");
                        }
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"), errors);
                }
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn push(errors: &mut Vec<FieldError>, path: &str, message: impl Into<String>) {
    errors.push(FieldError {
        path: path.to_string(),
        message: message.into(),
    });
}
