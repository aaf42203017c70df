//! Parameter schemas and binding.
//!
//! A command declares its parameters as a static slice of [`ParamSpec`].
//! Raw JSON arguments from any caller are bound against that slice into
//! [`BoundParams`]: defaults filled in, values coerced to their semantic
//! type, unknown names rejected.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::model::TimePoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Text,
    Number,
    Integer,
    Boolean,
    /// Seconds, `"12.5s"` or `"HH:MM:SS:FF"`.
    Timecode,
    /// One of a fixed set of kebab-case options.
    Choice(&'static [&'static str]),
}

impl ParamType {
    pub fn label(self) -> &'static str {
        match self {
            ParamType::Text => "text",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Timecode => "timecode",
            ParamType::Choice(_) => "choice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Text(&'static str),
    Number(f64),
    Integer(i64),
    Boolean(bool),
}

impl DefaultValue {
    pub fn to_json(self) -> Value {
        match self {
            DefaultValue::Text(s) => Value::String(s.to_string()),
            DefaultValue::Number(n) => serde_json::json!(n),
            DefaultValue::Integer(i) => Value::from(i),
            DefaultValue::Boolean(b) => Value::Bool(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    None,
    Positive,
    NonNegative,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<DefaultValue>,
    pub constraint: Constraint,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, ty: ParamType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: true,
            default: None,
            constraint: Constraint::None,
            description,
        }
    }

    pub const fn optional(name: &'static str, ty: ParamType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: None,
            constraint: Constraint::None,
            description,
        }
    }

    pub const fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub const fn positive(mut self) -> Self {
        self.constraint = Constraint::Positive;
        self
    }

    pub const fn non_negative(mut self) -> Self {
        self.constraint = Constraint::NonNegative;
        self
    }
}

/// A parameter value after coercion to its declared type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
    Timecode(TimePoint),
    Choice(String),
}

impl ParamValue {
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Text(s) | ParamValue::Choice(s) => Value::String(s.clone()),
            ParamValue::Number(n) => serde_json::json!(n),
            ParamValue::Integer(i) => Value::from(*i),
            ParamValue::Boolean(b) => Value::Bool(*b),
            ParamValue::Timecode(TimePoint::Seconds(s)) => serde_json::json!(s),
            ParamValue::Timecode(tc) => Value::String(tc.to_string()),
        }
    }

    fn from_default(default: DefaultValue, ty: ParamType) -> Self {
        match (default, ty) {
            (DefaultValue::Text(s), ParamType::Choice(_)) => ParamValue::Choice(s.to_string()),
            (DefaultValue::Text(s), _) => ParamValue::Text(s.to_string()),
            (DefaultValue::Number(n), ParamType::Timecode) => ParamValue::Timecode(TimePoint::Seconds(n)),
            (DefaultValue::Number(n), _) => ParamValue::Number(n),
            (DefaultValue::Integer(i), _) => ParamValue::Integer(i),
            (DefaultValue::Boolean(b), _) => ParamValue::Boolean(b),
        }
    }
}

/// Validated parameters in schema order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BoundParams(IndexMap<String, ParamValue>);

impl BoundParams {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ParamValue::Text(s) | ParamValue::Choice(s)) => Some(s),
            _ => None,
        }
    }

    pub fn choice(&self, name: &str) -> Option<&str> {
        self.text(name)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.0.get(name) {
            Some(ParamValue::Number(n)) => Some(*n),
            Some(ParamValue::Integer(i)) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(ParamValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.0.get(name) {
            Some(ParamValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn time(&self, name: &str) -> Option<TimePoint> {
        match self.0.get(name) {
            Some(ParamValue::Timecode(t)) => Some(*t),
            _ => None,
        }
    }

    /// A timecode parameter in seconds at `frame_rate`.
    pub fn seconds(&self, name: &str, frame_rate: f64) -> Result<Option<f64>, AppError> {
        self.time(name)
            .map(|t| t.resolve(frame_rate).map_err(|reason| AppError::invalid(name, reason)))
            .transpose()
    }

    /// Check every bound timecode against `frame_rate`.
    pub fn check_timecodes(&self, frame_rate: f64) -> Result<(), AppError> {
        for (name, value) in &self.0 {
            if let ParamValue::Timecode(t) = value {
                t.resolve(frame_rate)
                    .map_err(|reason| AppError::invalid(name, reason))?;
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json_map(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

/// Bind raw arguments against a schema. Missing required parameters and
/// values that cannot be coerced are reported by name; nothing is partially
/// bound. `null` counts as absent.
pub fn validate(schema: &[ParamSpec], raw: &Map<String, Value>) -> Result<BoundParams, AppError> {
    reject_unknown(schema, raw)?;

    let mut bound = IndexMap::new();
    for spec in schema {
        match raw.get(spec.name).filter(|v| !v.is_null()) {
            Some(value) => {
                let coerced = coerce(spec, value).map_err(|reason| AppError::invalid(spec.name, reason))?;
                bound.insert(spec.name.to_string(), coerced);
            }
            None if spec.required => {
                return Err(AppError::MissingParameter {
                    name: spec.name.to_string(),
                });
            }
            None => {
                if let Some(default) = spec.default {
                    bound.insert(
                        spec.name.to_string(),
                        ParamValue::from_default(default, spec.ty),
                    );
                }
            }
        }
    }
    Ok(BoundParams(bound))
}

/// Check only the slots that are present. Used to vet partially bound
/// candidates from an interpreter before they reach the dispatcher.
pub fn type_check(schema: &[ParamSpec], raw: &Map<String, Value>) -> Result<(), AppError> {
    reject_unknown(schema, raw)?;
    for spec in schema {
        if let Some(value) = raw.get(spec.name).filter(|v| !v.is_null()) {
            coerce(spec, value).map_err(|reason| AppError::invalid(spec.name, reason))?;
        }
    }
    Ok(())
}

fn reject_unknown(schema: &[ParamSpec], raw: &Map<String, Value>) -> Result<(), AppError> {
    if let Some(unknown) = raw.keys().find(|k| !schema.iter().any(|s| s.name == k.as_str())) {
        let known: Vec<&str> = schema.iter().map(|s| s.name).collect();
        return Err(AppError::invalid(
            unknown,
            if known.is_empty() {
                "this command takes no parameters".to_string()
            } else {
                format!("unknown parameter, expected one of: {}", known.join(", "))
            },
        ));
    }
    Ok(())
}

/// Normalize a choice: case-insensitive, spaces and underscores read as hyphens.
pub fn normalize_choice(text: &str) -> String {
    let lowered = text.trim().to_lowercase().replace([' ', '_'], "-");
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn coerce(spec: &ParamSpec, value: &Value) -> Result<ParamValue, String> {
    let coerced = match spec.ty {
        ParamType::Text => {
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(format!("expected text, got {}", kind_of(value))),
            };
            if text.is_empty() {
                return Err("must not be empty".into());
            }
            ParamValue::Text(text)
        }
        ParamType::Number => {
            let n = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|n| n.is_finite())
            .ok_or_else(|| format!("expected a number, got {}", kind_of(value)))?;
            ParamValue::Number(n)
        }
        ParamType::Integer => {
            let i = match value {
                Value::Number(n) => n.as_i64().or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                        .map(|f| f as i64)
                }),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("expected an integer, got {}", kind_of(value)))?;
            ParamValue::Integer(i)
        }
        ParamType::Boolean => {
            let b = match value {
                Value::Bool(b) => Some(*b),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => Some(true),
                    "false" | "no" | "off" | "0" => Some(false),
                    _ => None,
                },
                _ => None,
            }
            .ok_or_else(|| format!("expected a boolean, got {}", kind_of(value)))?;
            ParamValue::Boolean(b)
        }
        ParamType::Timecode => {
            let t = match value {
                Value::Number(n) => n.as_f64().and_then(TimePoint::from_seconds),
                Value::String(s) => TimePoint::parse(s),
                _ => None,
            }
            .ok_or_else(|| {
                format!(
                    "expected seconds or HH:MM:SS:FF timecode, got {}",
                    kind_of(value)
                )
            })?;
            ParamValue::Timecode(t)
        }
        ParamType::Choice(options) => {
            let Value::String(s) = value else {
                return Err(format!("expected one of {}, got {}", options.join(", "), kind_of(value)));
            };
            let normalized = normalize_choice(s);
            if !options.contains(&normalized.as_str()) {
                return Err(format!("\"{s}\" is not one of {}", options.join(", ")));
            }
            ParamValue::Choice(normalized)
        }
    };

    let numeric = match &coerced {
        ParamValue::Number(n) => Some(*n),
        ParamValue::Integer(i) => Some(*i as f64),
        _ => None,
    };
    match (spec.constraint, numeric) {
        (Constraint::Positive, Some(n)) if n <= 0.0 => Err("must be greater than zero".into()),
        (Constraint::NonNegative, Some(n)) if n < 0.0 => Err("must not be negative".into()),
        _ => Ok(coerced),
    }
}

fn kind_of(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("\"{s}\""),
        Value::Array(_) => "an array".into(),
        Value::Object(_) => "an object".into(),
    }
}
