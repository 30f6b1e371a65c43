//! Resolution Pipeline - Engine Context and Generation Jobs
//!
//! The engine owns the shared, read-only configuration. Every resolution
//! borrows it immutably and builds fresh values, so resolving one preset can
//! never leak into the templates or into a sibling preset.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::DiffuseConfig;
use crate::hashing::payload_fingerprint;
use crate::preset::{PresetResolver, RequestPayload};
use crate::prompts::PromptResolver;
use crate::rng::RandomSource;
use crate::templates::TemplateRegistry;
use crate::validation::Validator;

pub const DEFAULT_MAX_DEPTH: usize = 32;
pub const MAX_BASENAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Recursion limit of {limit} exceeded during {context}")]
    RecursionLimit { limit: usize, context: String },
}

impl From<serde_json::Error> for ResolveError {
    fn from(err: serde_json::Error) -> Self {
        ResolveError::Configuration(err.to_string())
    }
}

/// Shared configuration every resolution reads from.
pub struct Engine {
    registry: TemplateRegistry,
    prompts: PromptResolver,
    allowed_keys: Option<BTreeSet<String>>,
    max_depth: usize,
    validator: Validator,
}

impl Engine {
    pub fn new(
        registry: TemplateRegistry,
        saved_prompts: BTreeMap<String, String>,
        allowed_keys: Option<BTreeSet<String>>,
        max_depth: usize,
    ) -> Self {
        Self {
            registry,
            prompts: PromptResolver::new(saved_prompts, max_depth),
            allowed_keys,
            max_depth,
            validator: Validator::new(),
        }
    }

    pub fn from_config(config: &DiffuseConfig) -> Result<Self, ResolveError> {
        let registry = TemplateRegistry::new(config.templates.clone())?;
        Ok(Self::new(
            registry,
            config.saved_prompts.clone(),
            config.allowed_keys.clone(),
            config.max_depth,
        ))
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn prompts(&self) -> &PromptResolver {
        &self.prompts
    }

    pub fn allowed_keys(&self) -> Option<&BTreeSet<String>> {
        self.allowed_keys.as_ref()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Txt2Img,
    Img2Img,
}

impl Stage {
    pub fn api_path(self) -> &'static str {
        match self {
            Stage::Txt2Img => "sdapi/v1/txt2img",
            Stage::Img2Img => "sdapi/v1/img2img",
        }
    }
}

/// A resolved payload ready for the generation service.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub preset_name: String,
    pub stage: Stage,
    pub api_path: &'static str,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub payload: RequestPayload,
    #[serde(skip)]
    resolver: PresetResolver,
}

impl GenerationJob {
    /// Resolve a preset into a first-stage job.
    pub fn resolve(
        resolver: PresetResolver,
        engine: &Engine,
        rng: &mut dyn RandomSource,
    ) -> Result<Self, ResolveError> {
        let payload = resolver.build_payload(engine, rng)?;
        let name = resolver.name().to_string();
        Self::assemble(resolver, name, Stage::Txt2Img, payload)
    }

    fn assemble(
        resolver: PresetResolver,
        preset_name: String,
        stage: Stage,
        payload: RequestPayload,
    ) -> Result<Self, ResolveError> {
        let fingerprint = payload_fingerprint(payload.fields())?;
        let job = Self {
            id: Uuid::new_v4(),
            preset_name,
            stage,
            api_path: stage.api_path(),
            created_at: Utc::now(),
            fingerprint,
            payload,
            resolver,
        };
        info!(
            job = %job.id,
            preset = %job.preset_name,
            stage = ?job.stage,
            model = job.payload.model().unwrap_or_default(),
            "generation job ready"
        );
        Ok(job)
    }

    pub fn resolver(&self) -> &PresetResolver {
        &self.resolver
    }

    pub fn has_next(&self) -> bool {
        self.resolver.next().is_some()
    }

    /// File stem for artifacts of this job: `{preset}-{model}` with
    /// non-alphanumerics replaced, truncated, then suffixed with epoch millis.
    pub fn basename(&self) -> String {
        let raw = format!(
            "{}-{}",
            self.preset_name,
            self.payload.model().unwrap_or_default()
        );
        let stem: String = raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .take(MAX_BASENAME_LEN)
            .collect();
        format!("{stem}-{}", self.created_at.timestamp_millis())
    }

    /// Resolve the chained `next` preset against a first-pass image. Returns
    /// `Ok(None)` when the preset declares no follow-up.
    pub fn next_job(
        &self,
        image: &[u8],
        engine: &Engine,
        rng: &mut dyn RandomSource,
    ) -> Result<Option<Self>, ResolveError> {
        let Some(next) = self.resolver.next() else {
            return Ok(None);
        };
        let mut payload = next.build_payload(engine, rng)?;
        if payload.get("denoising_strength").is_none() {
            return Err(ResolveError::Configuration(format!(
                "'denoising_strength' must be set on the next preset of '{}'",
                self.preset_name
            )));
        }
        payload.insert("init_images", Value::from(vec![encode_image(image)]));
        Self::assemble(next.clone(), self.preset_name.clone(), Stage::Img2Img, payload).map(Some)
    }

    /// Re-run this job's payload as img2img over its own output. Returns
    /// `Ok(None)` unless the preset asked for it.
    pub fn rediffuse_job(
        &self,
        image: &[u8],
        denoising_strength: f64,
    ) -> Result<Option<Self>, ResolveError> {
        if !self.resolver.rediffuse() {
            return Ok(None);
        }
        let mut payload = self.payload.clone();
        payload.insert("denoising_strength", Value::from(denoising_strength));
        payload.insert("init_images", Value::from(vec![encode_image(image)]));
        Self::assemble(
            self.resolver.clone(),
            self.preset_name.clone(),
            Stage::Img2Img,
            payload,
        )
        .map(Some)
    }
}

fn encode_image(image: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(image)
}
