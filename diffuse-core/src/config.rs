//! Configuration File - Templates, Saved Prompts and Presets
//!
//! One JSON document holds everything the engine needs. An override file,
//! when present, replaces the default file entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::pipeline::DEFAULT_MAX_DEPTH;
use crate::preset::PresetSpec;
use crate::templates::{TemplateBody, TemplateName};

pub const DEFAULT_CONFIG_PATH: &str = "./default_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config files not found: tried {0:?}")]
    NotFound(Vec<PathBuf>),
}

fn default_true() -> bool { true }
fn default_max_depth() -> usize { DEFAULT_MAX_DEPTH }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffuseConfig {
    #[serde(default)]
    pub templates: BTreeMap<TemplateName, TemplateBody>,
    #[serde(default)]
    pub saved_prompts: BTreeMap<String, String>,
    /// Request keys allowed into payloads; every key passes when absent.
    #[serde(default)]
    pub allowed_keys: Option<BTreeSet<String>>,
    #[serde(default)]
    pub presets: Vec<PresetSpec>,
    #[serde(default)]
    pub groups: Vec<PresetGroup>,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for DiffuseConfig {
    fn default() -> Self {
        Self {
            templates: BTreeMap::new(),
            saved_prompts: BTreeMap::new(),
            allowed_keys: None,
            presets: Vec::new(),
            groups: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Presets toggled together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub presets: Vec<PresetSpec>,
}

impl DiffuseConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the first existing file of `override_path`, then `default_path`.
    pub fn load(default_path: &Path, override_path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates: Vec<&Path> = override_path.into_iter().chain([default_path]).collect();
        for path in &candidates {
            if path.exists() {
                info!(path = %path.display(), "loading configuration");
                return Self::from_path(path);
            }
        }
        Err(ConfigError::NotFound(
            candidates.iter().map(|p| p.to_path_buf()).collect(),
        ))
    }

    /// Top-level presets followed by those of enabled groups.
    pub fn all_presets(&self) -> Vec<PresetSpec> {
        self.presets
            .iter()
            .chain(
                self.groups
                    .iter()
                    .filter(|g| g.enabled)
                    .flat_map(|g| g.presets.iter()),
            )
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "templates": {
            "default": { "model": "base", "steps": 20, "tags": ["core"] },
            "portrait": { "prompt": "portrait", "tags": ["subject"] }
        },
        "saved_prompts": { "quality": "masterpiece" },
        "allowed_keys": ["model", "steps", "negative_prompt"],
        "presets": [
            { "name": "a", "prompt": "/quality", "templates": ["portrait"] }
        ],
        "groups": [
            { "name": "on", "presets": [{ "name": "b" }] },
            { "name": "off", "enabled": false, "presets": [{ "name": "c" }] }
        ]
    }"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_sample() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.json", SAMPLE);
        let config = DiffuseConfig::from_path(&path).unwrap();

        assert_eq!(config.templates.len(), 2);
        assert_eq!(config.saved_prompts["quality"], "masterpiece");
        assert!(config.allowed_keys.as_ref().unwrap().contains("steps"));
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);

        let names: Vec<_> = config.all_presets().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_override_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let default = write(&dir, "default.json", r#"{ "max_depth": 4 }"#);
        let override_path = write(&dir, "override.json", r#"{ "max_depth": 9 }"#);

        let config = DiffuseConfig::load(&default, Some(&override_path)).unwrap();
        assert_eq!(config.max_depth, 9);

        let missing = dir.path().join("missing.json");
        let config = DiffuseConfig::load(&default, Some(&missing)).unwrap();
        assert_eq!(config.max_depth, 4);
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new().unwrap();
        let err = DiffuseConfig::load(&dir.path().join("nope.json"), None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(paths) if paths.len() == 1));
    }

    #[test]
    fn test_malformed_templates_field() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "bad.json",
            r#"{ "presets": [{ "name": "p", "templates": "not-a-list" }] }"#,
        );
        assert!(matches!(
            DiffuseConfig::from_path(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
