//! Saved Prompts - `/identifier` Expansion

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::ResolveError;
use crate::randomizer::Randomizer;
use crate::rng::RandomSource;

static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[a-zA-Z0-9_]+").expect("Invalid saved prompt token regex"));

/// Expands `/identifier` tokens against a table of saved prompts.
///
/// Text is randomized before tokens are looked up, and every looked-up value
/// is expanded the same way. Identifiers missing from the table stay literal.
#[derive(Debug, Clone, Default)]
pub struct PromptResolver {
    saved: BTreeMap<String, String>,
    max_depth: usize,
}

impl PromptResolver {
    pub fn new(saved: BTreeMap<String, String>, max_depth: usize) -> Self {
        Self { saved, max_depth }
    }

    pub fn saved_prompts(&self) -> &BTreeMap<String, String> {
        &self.saved
    }

    pub fn resolve(&self, text: &str, rng: &mut dyn RandomSource) -> Result<String, ResolveError> {
        self.resolve_at(text, rng, 0)
    }

    fn resolve_at(
        &self,
        text: &str,
        rng: &mut dyn RandomSource,
        depth: usize,
    ) -> Result<String, ResolveError> {
        if depth > self.max_depth {
            return Err(ResolveError::RecursionLimit {
                limit: self.max_depth,
                context: format!("saved prompt expansion of '{text}'"),
            });
        }

        let prompt = Randomizer::apply(text, rng)?;

        // Splice by match span so `/a` never rewrites part of `/abc`.
        let mut expanded = String::with_capacity(prompt.len());
        let mut last = 0;
        for token in TOKEN_REGEX.find_iter(&prompt) {
            let Some(saved) = self.saved.get(&token.as_str()[1..]) else {
                continue;
            };
            expanded.push_str(&prompt[last..token.start()]);
            expanded.push_str(&self.resolve_at(saved, rng, depth + 1)?);
            last = token.end();
        }
        expanded.push_str(&prompt[last..]);

        Ok(expanded)
    }
}
