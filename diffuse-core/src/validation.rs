//! Payload Validation - Rule/Report Separation
//!
//! Rules produce structured violations.
//! The report folds violations into one resolution error.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pipeline::ResolveError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Configuration,
    Validation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub kind: ViolationKind,
    pub message: String,
}

/// Rules look at the request fields of a flattened preset.
pub trait PayloadRule {
    fn name(&self) -> &'static str;
    fn validate(&self, fields: &Map<String, Value>) -> Vec<Violation>;
}

// --- Concrete Rules ---

pub struct ModelRule;

impl PayloadRule for ModelRule {
    fn name(&self) -> &'static str { "model" }

    fn validate(&self, fields: &Map<String, Value>) -> Vec<Violation> {
        if fields.get("model").is_some_and(is_truthy) {
            return vec![];
        }
        vec![Violation {
            rule: self.name().to_string(),
            kind: ViolationKind::Configuration,
            message: "'model' must be set".to_string(),
        }]
    }
}

pub struct BatchCountRule;

impl PayloadRule for BatchCountRule {
    fn name(&self) -> &'static str { "batch_count" }

    fn validate(&self, fields: &Map<String, Value>) -> Vec<Violation> {
        match fields.get("batch_count") {
            None => vec![],
            Some(count) if count.as_f64() == Some(1.0) => vec![],
            Some(count) => vec![Violation {
                rule: self.name().to_string(),
                kind: ViolationKind::Validation,
                message: format!("'batch_count' should be 1, got {count}"),
            }],
        }
    }
}

/// Validator runs every rule and reports the combined outcome
pub struct Validator {
    rules: Vec<Box<dyn PayloadRule + Send + Sync>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(ModelRule),
                Box::new(BatchCountRule),
            ],
        }
    }

    pub fn violations(&self, fields: &Map<String, Value>) -> Vec<Violation> {
        self.rules.iter().flat_map(|rule| rule.validate(fields)).collect()
    }

    /// The first violation decides the error kind; all messages are kept.
    pub fn validate(&self, fields: &Map<String, Value>) -> Result<(), ResolveError> {
        let violations = self.violations(fields);
        let Some(first) = violations.first() else {
            return Ok(());
        };

        let message = violations
            .iter()
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ");

        Err(match first.kind {
            ViolationKind::Configuration => ResolveError::Configuration(message),
            ViolationKind::Validation => ResolveError::Validation(message),
        })
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// Values that occur more than once, in order of their second appearance.
pub fn find_duplicates<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for item in items {
        if !seen.insert(item) && !dups.iter().any(|d: &String| d == item) {
            dups.push(item.to_string());
        }
    }
    dups
}

/// JSON truthiness: null, false, zero, and empty strings or containers are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
