//! Preset Collection - Weighted Batch Selection
//!
//! Sampling is with replacement: `select(n)` always yields exactly `n`
//! resolvers, and the same preset may appear more than once. Each pick is a
//! fresh resolver, so repeated picks draw their own seeds, alternatives and
//! lora weights.

use tracing::{debug, warn};

use crate::config::DiffuseConfig;
use crate::pipeline::{Engine, GenerationJob, ResolveError};
use crate::preset::{PresetResolver, PresetSpec};
use crate::rng::RandomSource;

pub struct PresetCollection {
    engine: Engine,
    presets: Vec<PresetSpec>,
}

impl PresetCollection {
    pub fn new(engine: Engine, presets: Vec<PresetSpec>) -> Self {
        Self { engine, presets }
    }

    /// Build the engine and gather enabled presets from a configuration.
    pub fn from_config(config: &DiffuseConfig) -> Result<Self, ResolveError> {
        let engine = Engine::from_config(config)?;
        Ok(Self::new(engine, config.all_presets()))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn presets(&self) -> &[PresetSpec] {
        &self.presets
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PresetSpec> {
        self.presets.iter().filter(|p| p.enabled)
    }

    /// Find an enabled preset by name. The first match wins when names repeat.
    pub fn find(&self, name: &str) -> Option<&PresetSpec> {
        self.enabled().find(|p| p.name == name)
    }

    pub fn select(
        &self,
        count: usize,
        rng: &mut dyn RandomSource,
    ) -> Result<Vec<PresetResolver>, ResolveError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let enabled: Vec<&PresetSpec> = self.enabled().collect();
        if enabled.is_empty() {
            warn!(total = self.presets.len(), "no enabled presets to select from");
            return Err(ResolveError::Configuration(
                "no enabled presets to select from".to_string(),
            ));
        }

        let weights: Vec<f64> = enabled.iter().map(|p| p.weight).collect();
        let mut selected = Vec::with_capacity(count);
        for _ in 0..count {
            let spec = enabled[rng.pick_weighted(&weights)?];
            debug!(preset = %spec.name, "preset selected");
            selected.push(PresetResolver::new(spec));
        }
        Ok(selected)
    }

    /// Select `count` presets and resolve each into a job. A failing preset
    /// only fails its own slot.
    pub fn resolve_batch(
        &self,
        count: usize,
        rng: &mut dyn RandomSource,
    ) -> Result<Vec<Result<GenerationJob, ResolveError>>, ResolveError> {
        let selected = self.select(count, rng)?;
        Ok(selected
            .into_iter()
            .map(|resolver| GenerationJob::resolve(resolver, &self.engine, rng))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateRegistry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn collection(presets: serde_json::Value) -> PresetCollection {
        let engine = Engine::new(TemplateRegistry::default(), BTreeMap::new(), None, 8);
        PresetCollection::new(engine, serde_json::from_value(presets).unwrap())
    }

    #[test]
    fn test_select_returns_exact_count() {
        let collection = collection(json!([
            { "name": "a", "model": "m" },
            { "name": "b", "model": "m" },
            { "name": "c", "model": "m" }
        ]));
        let mut rng = StdRng::seed_from_u64(8);
        for count in [0, 1, 3, 10] {
            assert_eq!(collection.select(count, &mut rng).unwrap().len(), count);
        }
    }

    #[test]
    fn test_disabled_and_zero_weight_never_selected() {
        let collection = collection(json!([
            { "name": "off", "model": "m", "enabled": false },
            { "name": "zero", "model": "m", "weight": 0 },
            { "name": "on", "model": "m" }
        ]));
        let mut rng = StdRng::seed_from_u64(8);
        for resolver in collection.select(50, &mut rng).unwrap() {
            assert_eq!(resolver.name(), "on");
        }
    }

    #[test]
    fn test_selection_follows_weights() {
        let collection = collection(json!([
            { "name": "heavy", "model": "m", "weight": 3 },
            { "name": "light", "model": "m", "weight": 1 }
        ]));
        let mut rng = StdRng::seed_from_u64(13);
        let trials = 4000;
        let heavy = collection
            .select(trials, &mut rng)
            .unwrap()
            .iter()
            .filter(|r| r.name() == "heavy")
            .count();
        let ratio = heavy as f64 / trials as f64;
        assert!((ratio - 0.75).abs() < 0.05, "ratio {ratio}");
    }

    #[test]
    fn test_no_enabled_presets() {
        let collection = collection(json!([{ "name": "off", "model": "m", "enabled": false }]));
        let mut rng = StdRng::seed_from_u64(8);
        assert!(collection.select(0, &mut rng).unwrap().is_empty());
        assert!(matches!(
            collection.select(1, &mut rng),
            Err(ResolveError::Configuration(_))
        ));
    }

    #[test]
    fn test_batch_isolates_failures() {
        let collection = collection(json!([{ "name": "no-model" }]));
        let mut rng = StdRng::seed_from_u64(8);
        let jobs = collection.resolve_batch(2, &mut rng).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.is_err()));
    }

    #[test]
    fn test_find_by_name() {
        let collection = collection(json!([
            { "name": "dup", "model": "first" },
            { "name": "dup", "model": "second" }
        ]));
        let found = collection.find("dup").unwrap();
        assert_eq!(found.body.fields["model"], json!("first"));
        assert!(collection.find("missing").is_none());
    }
}
