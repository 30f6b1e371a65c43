//! Diffuse Core - Preset Composition Engine
//!
//! Turns user-authored presets and reusable templates into flat request
//! payloads for an image generation service.
//!
//! # Ground Rules
//! 1. The first-declared template wins; the preset's own fields win over all
//! 2. Missing names are empty, never errors
//! 3. Shape errors are configuration errors, bad values are validation errors
//! 4. Every recursion is depth-limited
//! 5. All randomness comes from an injected source
//! 6. Resolution never mutates shared configuration

pub mod rng;
pub mod randomizer;
pub mod prompts;
pub mod templates;
pub mod graph;
pub mod concat;
pub mod validation;
pub mod hashing;
pub mod preset;
pub mod collection;
pub mod config;
pub mod pipeline;
pub mod telemetry;

pub use rng::RandomSource;
pub use randomizer::Randomizer;
pub use prompts::PromptResolver;
pub use templates::{TemplateBody, TemplateRef, TemplateRegistry, TagOp};
pub use graph::{Flattened, TemplateGraph};
pub use concat::{LoraRef, LoraWeight, PromptConcatenator, PromptElement, ResolvedLora};
pub use validation::{PayloadRule, Validator, Violation, ViolationKind};
pub use hashing::{canonical_json, payload_fingerprint};
pub use preset::{PresetResolver, PresetSpec, RequestPayload};
pub use collection::PresetCollection;
pub use config::{ConfigError, DiffuseConfig};
pub use pipeline::{Engine, GenerationJob, ResolveError, Stage};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
