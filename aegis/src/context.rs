//! Evaluation context supplied by the caller.
//!
//! A context is an ephemeral JSON object (actor, role, target, payload,
//! amounts, timestamps...). Validators read it through dotted paths such as
//! `payload.amount` or `items.0.name`; absent paths are data, not errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Read-only key/value context for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvalContext(Map<String, Value>);

impl EvalContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value. Non-object values produce an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    /// Builder: set a top-level key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set a top-level key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Resolve a dotted path. Numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    /// String value at a path.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path).and_then(Value::as_str)
    }

    /// Numeric value at a path; numeric strings are accepted.
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        match self.lookup(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether the path holds a non-null, non-empty value.
    pub fn is_present(&self, path: &str) -> bool {
        self.lookup(path).map(is_present_value).unwrap_or(false)
    }

    /// Actor identity, from `actor_id` or `actor`.
    pub fn actor_id(&self) -> Option<&str> {
        self.get_str("actor_id").or_else(|| self.get_str("actor"))
    }

    /// Operation type, from `operation_type` or `operation`.
    pub fn operation_type(&self) -> Option<&str> {
        self.get_str("operation_type")
            .or_else(|| self.get_str("operation"))
    }

    /// Target resource identifier.
    pub fn target(&self) -> Option<&str> {
        self.get_str("target")
            .or_else(|| self.get_str("target_table"))
    }

    /// Work item the evaluation belongs to.
    pub fn work_item_key(&self) -> Option<&str> {
        self.get_str("work_item_key")
            .or_else(|| self.get_str("sd_key"))
    }

    /// SHA-256 of the serialized context, for audit records.
    ///
    /// Keys are kept sorted by the underlying map, so equal contexts hash equally.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(&self.0).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())
    }
}

impl From<Value> for EvalContext {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

/// Non-null, and non-empty for strings, arrays and objects.
pub fn is_present_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

/// Loose truthiness for flag columns: `true`, non-zero numbers, `"true"`/`"1"`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}
