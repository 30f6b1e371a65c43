//! Inline Alternation - `[a|b|2:c]`
//!
//! A bracket group without nested brackets is replaced by one of its
//! `|`-separated alternatives. An alternative may start with `weight:` to bias
//! the pick; the default weight is 1.
//!
//! Resolution runs exactly two passes. The second pass wraps the first pass's
//! output in one more bracket pair, so a top-level `a|b` string is itself an
//! alternation and an alternative that produced fresh bracket syntax gets one
//! more chance to resolve. Whatever still contains brackets after that is kept
//! as literal text.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::pipeline::ResolveError;
use crate::rng::RandomSource;

static GROUP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\[\]]+\]").expect("Invalid alternation group regex"));

static WEIGHTED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*((?:0|[1-9]\d*)(?:\.\d+)?):(.*)$").expect("Invalid weighted alternative regex")
});

pub struct Randomizer;

impl Randomizer {
    /// Resolve every alternation group in `text`.
    pub fn apply(text: &str, rng: &mut dyn RandomSource) -> Result<String, ResolveError> {
        let first_pass = Self::substitute(text, rng)?;
        if first_pass.is_empty() {
            return Ok(String::new());
        }
        Self::substitute(&format!("[{first_pass}]"), rng)
    }

    /// Like [`Randomizer::apply`], but for arbitrary JSON values. Only strings
    /// are touched.
    pub fn apply_value(value: &Value, rng: &mut dyn RandomSource) -> Result<Value, ResolveError> {
        match value {
            Value::String(s) => Ok(Value::String(Self::apply(s, rng)?)),
            other => Ok(other.clone()),
        }
    }

    fn substitute(text: &str, rng: &mut dyn RandomSource) -> Result<String, ResolveError> {
        let mut failure = None;
        let replaced = GROUP_REGEX.replace_all(text, |caps: &Captures<'_>| {
            if failure.is_some() {
                return String::new();
            }
            match Self::pick(&caps[0], rng) {
                Ok(choice) => choice,
                Err(e) => {
                    failure = Some(e);
                    String::new()
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(replaced.into_owned()),
        }
    }

    fn pick(group: &str, rng: &mut dyn RandomSource) -> Result<String, ResolveError> {
        let inner = &group[1..group.len() - 1];
        let (values, weights): (Vec<&str>, Vec<f64>) = inner.split('|').map(split_weight).unzip();
        let index = rng.pick_weighted(&weights)?;
        Ok(values[index].to_string())
    }
}

fn split_weight(candidate: &str) -> (&str, f64) {
    WEIGHTED_REGEX
        .captures(candidate)
        .and_then(|caps| {
            let weight = caps[1].parse::<f64>().ok()?;
            let value = caps.get(2)?.as_str();
            Some((value, weight))
        })
        .unwrap_or((candidate, 1.0))
}
