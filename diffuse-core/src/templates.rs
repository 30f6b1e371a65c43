//! Template System - Composable Preset Fragments
//!
//! A template body carries the same fields as a preset (prompt text, prompt
//! elements, loras, further template references and any request field such
//! as `model` or `steps`). Template references come in four shapes, parsed
//! once into [`TemplateRef`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::concat::{LoraRef, PromptElement};
use crate::pipeline::ResolveError;

pub type TemplateName = String;

/// Key under which `one_of` candidates carry their selection weight.
pub const WEIGHT_KEY: &str = "_weight";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplateBody {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub prompt_elements: Vec<PromptElement>,
    #[serde(default)]
    pub loras: Vec<LoraRef>,
    #[serde(default, deserialize_with = "deserialize_template_refs")]
    pub templates: Vec<TemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Request fields passed through to the payload (`model`, `steps`, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TemplateBody {
    pub fn from_value(value: Value) -> Result<Self, ResolveError> {
        if !value.is_object() {
            return Err(ResolveError::Configuration(format!(
                "a template body must be a mapping, got {value}"
            )));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// One entry of a `templates` list.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateRef {
    /// Looked up in the registry after randomization. Unknown names yield an
    /// empty body.
    Name(String),
    /// Weighted pick among further references.
    OneOf(Vec<WeightedRef>),
    /// Set algebra over tags, followed by a uniform pick.
    Selectors(Vec<TagOp>),
    /// A manually inlined body.
    Inline(Box<TemplateBody>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedRef {
    pub weight: f64,
    pub reference: TemplateRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOp {
    Add(String),
    Subtract(String),
    Intersect(String),
}

impl TagOp {
    fn parse(value: Value) -> Result<Vec<Self>, ResolveError> {
        match value {
            Value::String(tag) => Ok(vec![TagOp::Add(tag)]),
            Value::Object(map) => {
                let table: [(&str, fn(String) -> TagOp); 3] = [
                    ("add", TagOp::Add),
                    ("subtract", TagOp::Subtract),
                    ("intersect", TagOp::Intersect),
                ];
                let mut ops = Vec::new();
                for (key, build) in table {
                    if let Some(tag) = map.get(key) {
                        let tag = tag.as_str().ok_or_else(|| {
                            ResolveError::Configuration(format!("selector '{key}' must name a tag"))
                        })?;
                        ops.push(build(tag.to_string()));
                    }
                }
                if ops.is_empty() {
                    return Err(ResolveError::Configuration(format!(
                        "a selector needs one of 'add', 'subtract' or 'intersect': {}",
                        Value::Object(map)
                    )));
                }
                Ok(ops)
            }
            other => Err(ResolveError::Configuration(format!(
                "a selector must be a tag name or an operation mapping, got {other}"
            ))),
        }
    }
}

impl TemplateRef {
    pub fn from_value(value: Value) -> Result<Self, ResolveError> {
        match value {
            Value::String(name) => Ok(TemplateRef::Name(name)),
            Value::Object(mut map) => {
                if map.contains_key("selectors") {
                    if map.contains_key("templates") {
                        return Err(ResolveError::Configuration(
                            "only one of 'selectors' and 'templates' can exist in a template reference"
                                .to_string(),
                        ));
                    }
                    let selectors = match map.remove("selectors") {
                        Some(Value::Array(items)) => items,
                        _ => {
                            return Err(ResolveError::Configuration(
                                "'selectors' must be a list".to_string(),
                            ))
                        }
                    };
                    let mut ops = Vec::new();
                    for selector in selectors {
                        ops.extend(TagOp::parse(selector)?);
                    }
                    return Ok(TemplateRef::Selectors(ops));
                }

                if let Some(candidates) = map.remove("one_of") {
                    return Ok(TemplateRef::OneOf(parse_candidates(candidates)?));
                }

                map.remove(WEIGHT_KEY);
                Ok(TemplateRef::Inline(Box::new(TemplateBody::from_value(
                    Value::Object(map),
                )?)))
            }
            other => Err(ResolveError::Configuration(format!(
                "a template reference must be a name or a mapping, got {other}"
            ))),
        }
    }
}

fn parse_candidates(candidates: Value) -> Result<Vec<WeightedRef>, ResolveError> {
    let Value::Array(items) = candidates else {
        return Err(ResolveError::Configuration("'one_of' must be a list".to_string()));
    };
    if items.is_empty() {
        return Err(ResolveError::Configuration(
            "at least 1 candidate is required in 'one_of'".to_string(),
        ));
    }

    items
        .into_iter()
        .map(|item| {
            let weight = candidate_weight(&item)?;
            Ok(WeightedRef {
                weight,
                reference: TemplateRef::from_value(item)?,
            })
        })
        .collect()
}

/// The `_weight` of a `one_of` candidate; plain names weigh 1.
pub(crate) fn candidate_weight(item: &Value) -> Result<f64, ResolveError> {
    match item.get(WEIGHT_KEY) {
        None => Ok(1.0),
        Some(w) => w.as_f64().ok_or_else(|| {
            ResolveError::Configuration(format!("'{WEIGHT_KEY}' must be a number, got {w}"))
        }),
    }
}

/// Normalize a `templates` field: a list stays a list, a lone `one_of`
/// selector becomes a one-element list.
pub fn parse_template_refs(value: Value) -> Result<Vec<TemplateRef>, ResolveError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.into_iter().map(TemplateRef::from_value).collect(),
        Value::Object(map) if map.contains_key("one_of") => {
            Ok(vec![TemplateRef::from_value(Value::Object(map))?])
        }
        other => Err(ResolveError::Configuration(format!(
            "'templates' must be a list, got {other}"
        ))),
    }
}

fn deserialize_template_refs<'de, D>(deserializer: D) -> Result<Vec<TemplateRef>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parse_template_refs(value).map_err(serde::de::Error::custom)
}

impl Serialize for TemplateRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TemplateRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        TemplateRef::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl TemplateRef {
    fn to_value(&self) -> Value {
        match self {
            TemplateRef::Name(name) => Value::String(name.clone()),
            TemplateRef::OneOf(candidates) => {
                let items = candidates
                    .iter()
                    .map(|c| {
                        let mut item = c.reference.to_value();
                        if let Value::Object(map) = &mut item {
                            map.insert(WEIGHT_KEY.to_string(), c.weight.into());
                        }
                        item
                    })
                    .collect();
                serde_json::json!({ "one_of": Value::Array(items) })
            }
            TemplateRef::Selectors(ops) => {
                let items: Vec<Value> = ops
                    .iter()
                    .map(|op| match op {
                        TagOp::Add(tag) => serde_json::json!({ "add": tag }),
                        TagOp::Subtract(tag) => serde_json::json!({ "subtract": tag }),
                        TagOp::Intersect(tag) => serde_json::json!({ "intersect": tag }),
                    })
                    .collect();
                serde_json::json!({ "selectors": items })
            }
            TemplateRef::Inline(body) => serde_json::to_value(body.as_ref()).unwrap_or(Value::Null),
        }
    }
}

/// Template registry - named bodies plus the tag index derived from them
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<TemplateName, TemplateBody>,
    tags: BTreeMap<String, BTreeSet<TemplateName>>,
}

impl TemplateRegistry {
    pub fn new(templates: BTreeMap<TemplateName, TemplateBody>) -> Result<Self, ResolveError> {
        let mut tags: BTreeMap<String, BTreeSet<TemplateName>> = BTreeMap::new();
        for (name, body) in &templates {
            for tag in &body.tags {
                if tag.contains(['^', '-', '+']) {
                    return Err(ResolveError::Configuration(format!(
                        "tag should not contain -, +, or ^: '{tag}' on template '{name}'"
                    )));
                }
                tags.entry(tag.clone()).or_default().insert(name.clone());
            }
        }
        Ok(Self { templates, tags })
    }

    pub fn get(&self, name: &str) -> Option<&TemplateBody> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &TemplateName> {
        self.templates.keys()
    }

    pub fn tagged(&self, tag: &str) -> Option<&BTreeSet<TemplateName>> {
        self.tags.get(tag)
    }

    pub fn tags(&self) -> &BTreeMap<String, BTreeSet<TemplateName>> {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Evaluate selector operations left to right, starting from the empty set.
    pub fn select_tagged(&self, ops: &[TagOp]) -> BTreeSet<TemplateName> {
        let empty = BTreeSet::new();
        ops.iter().fold(BTreeSet::new(), |mut candidates, op| {
            match op {
                TagOp::Add(tag) => {
                    candidates.extend(self.tagged(tag).unwrap_or(&empty).iter().cloned());
                }
                TagOp::Subtract(tag) => {
                    let tagged = self.tagged(tag).unwrap_or(&empty);
                    candidates.retain(|name| !tagged.contains(name));
                }
                TagOp::Intersect(tag) => {
                    let tagged = self.tagged(tag).unwrap_or(&empty);
                    candidates.retain(|name| tagged.contains(name));
                }
            }
            candidates
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TemplateRegistry {
        let templates: BTreeMap<String, TemplateBody> = serde_json::from_value(json!({
            "t1": { "prompt": "one", "tags": ["style", "warm"] },
            "t2": { "prompt": "two", "tags": ["style"] },
            "t3": { "prompt": "three", "tags": ["warm"] },
        }))
        .unwrap();
        TemplateRegistry::new(templates).unwrap()
    }

    #[test]
    fn test_tag_index() {
        let registry = registry();
        let style: Vec<_> = registry.tagged("style").unwrap().iter().cloned().collect();
        assert_eq!(style, vec!["t1", "t2"]);
        assert!(registry.tagged("cold").is_none());
    }

    #[test]
    fn test_invalid_tag_rejected() {
        let templates: BTreeMap<String, TemplateBody> =
            serde_json::from_value(json!({ "t": { "tags": ["a-b"] } })).unwrap();
        assert!(matches!(
            TemplateRegistry::new(templates),
            Err(ResolveError::Configuration(_))
        ));
    }

    #[test]
    fn test_selector_set_algebra() {
        let registry = registry();
        let picked = registry.select_tagged(&[
            TagOp::Add("style".into()),
            TagOp::Add("warm".into()),
            TagOp::Subtract("style".into()),
        ]);
        assert_eq!(picked.into_iter().collect::<Vec<_>>(), vec!["t3"]);

        let picked = registry.select_tagged(&[
            TagOp::Add("style".into()),
            TagOp::Intersect("warm".into()),
        ]);
        assert_eq!(picked.into_iter().collect::<Vec<_>>(), vec!["t1"]);
    }

    #[test]
    fn test_parse_reference_shapes() {
        assert_eq!(
            TemplateRef::from_value(json!("base")).unwrap(),
            TemplateRef::Name("base".into())
        );

        let one_of = TemplateRef::from_value(json!({
            "one_of": ["a", { "prompt": "inline", "_weight": 3 }]
        }))
        .unwrap();
        let TemplateRef::OneOf(candidates) = one_of else {
            panic!("expected one_of");
        };
        assert_eq!(candidates[0].weight, 1.0);
        assert_eq!(candidates[1].weight, 3.0);
        assert!(matches!(&candidates[1].reference, TemplateRef::Inline(body) if body.prompt == "inline"));

        let selectors = TemplateRef::from_value(json!({
            "selectors": ["style", { "subtract": "warm" }]
        }))
        .unwrap();
        assert_eq!(
            selectors,
            TemplateRef::Selectors(vec![
                TagOp::Add("style".into()),
                TagOp::Subtract("warm".into())
            ])
        );
    }

    #[test]
    fn test_selectors_and_templates_are_exclusive() {
        let err = TemplateRef::from_value(json!({
            "selectors": ["style"],
            "templates": ["x"]
        }))
        .unwrap_err();
        assert!(matches!(err, ResolveError::Configuration(_)));
    }

    #[test]
    fn test_templates_field_normalization() {
        let refs = parse_template_refs(json!({ "one_of": ["a", "b"] })).unwrap();
        assert_eq!(refs.len(), 1);
        assert!(matches!(refs[0], TemplateRef::OneOf(_)));

        assert!(parse_template_refs(json!("a")).is_err());
        assert!(parse_template_refs(json!({ "prompt": "x" })).is_err());
        assert!(parse_template_refs(json!({ "one_of": [] })).is_err());
    }

    #[test]
    fn test_body_keeps_request_fields() {
        let body = TemplateBody::from_value(json!({
            "prompt": "p",
            "model": "m1",
            "steps": 20
        }))
        .unwrap();
        assert_eq!(body.fields.get("model"), Some(&json!("m1")));
        assert_eq!(body.fields.get("steps"), Some(&json!(20)));
        assert!(!body.fields.contains_key("prompt"));
    }

    #[test]
    fn test_non_list_prompt_elements_rejected() {
        let err = TemplateBody::from_value(json!({ "prompt_elements": "oops" })).unwrap_err();
        assert!(matches!(err, ResolveError::Configuration(_)));
    }
}
