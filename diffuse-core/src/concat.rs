//! Prompt Concatenation - Elements, Base Prompt, Lora Tags
//!
//! The final prompt is `element,element,...,base` resolved through the saved
//! prompt table, followed directly by one `<lora:ALIAS:WEIGHT>` tag per lora.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pipeline::ResolveError;
use crate::prompts::PromptResolver;
use crate::rng::RandomSource;
use crate::templates::WEIGHT_KEY;
use crate::validation::find_duplicates;

/// A keyword, or an unweighted pick among keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptElement {
    Text(String),
    OneOf { one_of: Vec<String> },
}

impl PromptElement {
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, PromptElement::Text(s) if s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoraRef {
    OneOf { one_of: Vec<LoraSpec> },
    Single(LoraSpec),
}

impl LoraRef {
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            LoraRef::OneOf { .. } => false,
            LoraRef::Single(spec) => {
                spec.alias.is_none() && spec.weight.is_none() && spec.extra.is_empty()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoraSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<LoraWeight>,
    /// Anything else the lora declares (`file`, `_weight`, notes).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoraSpec {
    fn selection_weight(&self) -> f64 {
        self.extra
            .get(WEIGHT_KEY)
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
    }
}

/// A fixed weight, or a `[low, high]` range drawn from per resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoraWeight {
    Fixed(f64),
    Range(Vec<f64>),
}

impl LoraWeight {
    fn draw(&self, alias: &str, rng: &mut dyn RandomSource) -> Result<f64, ResolveError> {
        match self {
            LoraWeight::Fixed(weight) => Ok(*weight),
            LoraWeight::Range(bounds) => {
                let [low, high] = bounds.as_slice() else {
                    return Err(ResolveError::Validation(format!(
                        "a weight range must be 2, got {bounds:?} for lora '{alias}'"
                    )));
                };
                if !low.is_finite() || !high.is_finite() || low > high {
                    return Err(ResolveError::Validation(format!(
                        "invalid weight range [{low}, {high}] for lora '{alias}'"
                    )));
                }
                Ok(rng.draw_uniform(*low, *high))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLora {
    pub alias: String,
    pub weight: f64,
}

impl fmt::Display for ResolvedLora {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Debug keeps the fractional part of whole weights: `1.0`, not `1`.
        write!(f, "<lora:{}:{:?}>", self.alias, self.weight)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatenatedPrompt {
    pub prompt: String,
    pub loras: Vec<ResolvedLora>,
}

pub struct PromptConcatenator<'a> {
    resolver: &'a PromptResolver,
}

impl<'a> PromptConcatenator<'a> {
    pub fn new(resolver: &'a PromptResolver) -> Self {
        Self { resolver }
    }

    pub fn concatenate(
        &self,
        elements: &[PromptElement],
        prompt: &str,
        loras: &[LoraRef],
        rng: &mut dyn RandomSource,
    ) -> Result<ConcatenatedPrompt, ResolveError> {
        let mut parts = Vec::with_capacity(elements.len() + 1);
        for element in elements {
            let keyword = self.select_and_resolve(element, rng)?;
            if !keyword.is_empty() {
                parts.push(keyword);
            }
        }
        parts.push(prompt.to_string());

        let text = self.resolver.resolve(&parts.join(","), rng)?;
        let loras = resolve_loras(loras, rng)?;
        let tags: String = loras.iter().map(ToString::to_string).collect();

        Ok(ConcatenatedPrompt {
            prompt: text + &tags,
            loras,
        })
    }

    fn select_and_resolve(
        &self,
        element: &PromptElement,
        rng: &mut dyn RandomSource,
    ) -> Result<String, ResolveError> {
        let keyword = match element {
            PromptElement::Text(text) => text,
            PromptElement::OneOf { one_of } => {
                if one_of.is_empty() {
                    return Err(ResolveError::Configuration(
                        "a prompt element 'one_of' needs at least 1 candidate".to_string(),
                    ));
                }
                &one_of[rng.pick_uniform(one_of.len())]
            }
        };
        self.resolver.resolve(keyword, rng)
    }
}

/// Pick concrete loras, draw their weights and check aliases are distinct.
pub fn resolve_loras(
    loras: &[LoraRef],
    rng: &mut dyn RandomSource,
) -> Result<Vec<ResolvedLora>, ResolveError> {
    let mut resolved = Vec::with_capacity(loras.len());
    for lora in loras {
        let spec = match lora {
            LoraRef::Single(spec) => spec,
            LoraRef::OneOf { one_of } => {
                if one_of.is_empty() {
                    return Err(ResolveError::Configuration(
                        "a lora 'one_of' needs at least 1 candidate".to_string(),
                    ));
                }
                let weights: Vec<f64> = one_of.iter().map(LoraSpec::selection_weight).collect();
                &one_of[rng.pick_weighted(&weights)?]
            }
        };

        let alias = spec.alias.clone().ok_or_else(|| {
            ResolveError::Validation(format!("'alias' must be set on lora {spec:?}"))
        })?;
        let weight = spec
            .weight
            .as_ref()
            .ok_or_else(|| ResolveError::Validation(format!("'weight' must be set on lora '{alias}'")))?
            .draw(&alias, rng)?;
        resolved.push(ResolvedLora { alias, weight });
    }

    let dups = find_duplicates(resolved.iter().map(|l| l.alias.as_str()));
    if !dups.is_empty() {
        return Err(ResolveError::Validation(format!(
            "duplicate loras should not exist: {dups:?}"
        )));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn loras(value: Value) -> Vec<LoraRef> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_elements_prompt_and_tags() {
        let resolver = PromptResolver::new(
            [("q".to_string(), "best quality".to_string())].into(),
            8,
        );
        let concat = PromptConcatenator::new(&resolver);
        let mut rng = StdRng::seed_from_u64(9);

        let elements = vec![
            PromptElement::Text("/q".into()),
            PromptElement::Text(String::new()),
            PromptElement::OneOf { one_of: vec!["solo".into()] },
        ];
        let out = concat
            .concatenate(
                &elements,
                "forest",
                &loras(json!([{ "alias": "detail", "weight": 0.5 }])),
                &mut rng,
            )
            .unwrap();
        assert_eq!(out.prompt, "best quality,solo,forest<lora:detail:0.5>");
        assert_eq!(out.loras, vec![ResolvedLora { alias: "detail".into(), weight: 0.5 }]);
    }

    #[test]
    fn test_empty_base_prompt_keeps_separator() {
        let resolver = PromptResolver::default();
        let concat = PromptConcatenator::new(&resolver);
        let mut rng = StdRng::seed_from_u64(3);

        let elements = vec![PromptElement::Text("a".into()), PromptElement::Text("b".into())];
        let out = concat.concatenate(&elements, "", &[], &mut rng).unwrap();
        assert_eq!(out.prompt, "a,b,");

        let out = concat.concatenate(&[], "", &[], &mut rng).unwrap();
        assert_eq!(out.prompt, "");
    }

    #[test]
    fn test_whole_weight_renders_fraction() {
        let lora = ResolvedLora { alias: "x".into(), weight: 1.0 };
        assert_eq!(lora.to_string(), "<lora:x:1.0>");
        let lora = ResolvedLora { alias: "x".into(), weight: 0.35 };
        assert_eq!(lora.to_string(), "<lora:x:0.35>");
    }

    #[test]
    fn test_weight_range_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(17);
        let refs = loras(json!([{ "alias": "a", "weight": [0.2, 0.8] }]));
        for _ in 0..1000 {
            let weight = resolve_loras(&refs, &mut rng).unwrap()[0].weight;
            assert!((0.2..=0.8).contains(&weight), "weight {weight}");
        }
    }

    #[test]
    fn test_malformed_range_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        for weight in [json!([0.2]), json!([0.1, 0.2, 0.3]), json!([0.9, 0.1])] {
            let refs = loras(json!([{ "alias": "a", "weight": weight }]));
            assert!(matches!(
                resolve_loras(&refs, &mut rng),
                Err(ResolveError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let refs = loras(json!([
            { "alias": "a", "weight": 1 },
            { "one_of": [{ "alias": "a", "weight": 0.3 }] }
        ]));
        let err = resolve_loras(&refs, &mut rng).unwrap_err();
        assert!(err.to_string().contains("duplicate loras"));
    }

    #[test]
    fn test_missing_alias_or_weight_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(resolve_loras(&loras(json!([{ "weight": 1 }])), &mut rng).is_err());
        assert!(resolve_loras(&loras(json!([{ "alias": "a" }])), &mut rng).is_err());
    }

    #[test]
    fn test_weighted_lora_one_of() {
        let mut rng = StdRng::seed_from_u64(2);
        let refs = loras(json!([{ "one_of": [
            { "alias": "never", "weight": 1, "_weight": 0 },
            { "alias": "always", "weight": 1 }
        ] }]));
        for _ in 0..100 {
            assert_eq!(resolve_loras(&refs, &mut rng).unwrap()[0].alias, "always");
        }
    }
}
