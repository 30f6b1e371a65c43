//! Presets - From Specification to Request Payload

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::concat::PromptConcatenator;
use crate::graph::TemplateGraph;
use crate::pipeline::{Engine, ResolveError};
use crate::randomizer::Randomizer;
use crate::rng::RandomSource;
use crate::templates::{TemplateBody, TemplateRef};

/// Template appended to every preset with the lowest precedence.
pub const DEFAULT_TEMPLATE: &str = "default";

/// Keys emitted regardless of the allow-list.
const REQUIRED_KEYS: &[&str] = &["model"];

fn default_weight() -> f64 { 1.0 }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresetSpec {
    #[serde(alias = "preset_name")]
    pub name: String,
    #[serde(default = "default_weight", alias = "sampling_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<PresetSpec>>,
    #[serde(default)]
    pub rediffuse: bool,
    #[serde(flatten)]
    pub body: TemplateBody,
}

impl PresetSpec {
    pub fn from_value(value: Value) -> Result<Self, ResolveError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// The engine's output: request fields plus `prompt` and `seed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestPayload(Map<String, Value>);

impl RequestPayload {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn prompt(&self) -> Option<&str> {
        self.0.get("prompt").and_then(Value::as_str)
    }

    pub fn model(&self) -> Option<&str> {
        self.0.get("model").and_then(Value::as_str)
    }

    pub fn seed(&self) -> Option<u32> {
        self.0
            .get("seed")
            .and_then(Value::as_u64)
            .and_then(|s| u32::try_from(s).ok())
    }

    pub(crate) fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }
}

/// One preset prepared for resolution. Building a payload never touches the
/// stored spec, so a resolver can be resolved again for a fresh draw.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetResolver {
    spec: PresetSpec,
    next: Option<Box<PresetResolver>>,
}

impl PresetResolver {
    pub fn new(spec: &PresetSpec) -> Self {
        let mut spec = spec.clone();
        spec.body
            .templates
            .push(TemplateRef::Name(DEFAULT_TEMPLATE.to_string()));
        let next = spec
            .next
            .as_deref()
            .map(|next| Box::new(PresetResolver::new(next)));
        Self { spec, next }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &PresetSpec {
        &self.spec
    }

    pub fn next(&self) -> Option<&PresetResolver> {
        self.next.as_deref()
    }

    pub fn rediffuse(&self) -> bool {
        self.spec.rediffuse
    }

    pub fn build_payload(
        &self,
        engine: &Engine,
        rng: &mut dyn RandomSource,
    ) -> Result<RequestPayload, ResolveError> {
        let graph = TemplateGraph::new(engine.registry(), engine.prompts(), engine.max_depth());
        let flat = graph.consume(&self.spec.body, rng)?;

        let prompt = PromptConcatenator::new(engine.prompts()).concatenate(
            &flat.prompt_elements,
            &flat.prompt,
            &flat.loras,
            rng,
        )?;

        let mut candidates = flat.fields;
        candidates.insert("negative_prompt".to_string(), Value::String(flat.negative_prompt));
        candidates.insert(
            "prompt_elements".to_string(),
            serde_json::to_value(&flat.prompt_elements)?,
        );
        candidates.insert("loras".to_string(), serde_json::to_value(&prompt.loras)?);

        let mut fields = Map::new();
        for (key, value) in candidates {
            let allowed = engine
                .allowed_keys()
                .map_or(true, |keys| keys.contains(&key) || REQUIRED_KEYS.contains(&key.as_str()));
            if allowed {
                fields.insert(key, Randomizer::apply_value(&value, rng)?);
            }
        }
        fields.insert("prompt".to_string(), Value::String(prompt.prompt));
        fields.insert("seed".to_string(), Value::from(rng.next_seed()));
        engine.validator().validate(&fields)?;

        debug!(preset = %self.spec.name, keys = fields.len(), loras = prompt.loras.len(), "payload built");
        Ok(RequestPayload(fields))
    }
}
