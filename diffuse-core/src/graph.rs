//! Template Graph - Flattening Nested References
//!
//! References are consumed in reverse declaration order and each merge puts
//! the newer body ahead of the accumulator, so the first reference a user
//! writes wins. The node's own fields are merged last and win over
//! everything inherited.

use std::borrow::Cow;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::concat::{LoraRef, PromptElement};
use crate::pipeline::ResolveError;
use crate::prompts::PromptResolver;
use crate::randomizer::Randomizer;
use crate::rng::RandomSource;
use crate::templates::{TemplateBody, TemplateRef, TemplateRegistry};

/// The running result of a merge. All four text/list fields are always
/// present; `fields` holds every other request field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
    pub prompt: String,
    pub negative_prompt: String,
    pub prompt_elements: Vec<PromptElement>,
    pub loras: Vec<LoraRef>,
    pub fields: Map<String, Value>,
}

impl From<&TemplateBody> for Flattened {
    fn from(body: &TemplateBody) -> Self {
        Self {
            prompt: body.prompt.clone(),
            negative_prompt: body.negative_prompt.clone(),
            prompt_elements: body.prompt_elements.clone(),
            loras: body.loras.clone(),
            fields: body.fields.clone(),
        }
    }
}

pub struct TemplateGraph<'a> {
    registry: &'a TemplateRegistry,
    prompts: &'a PromptResolver,
    max_depth: usize,
}

impl<'a> TemplateGraph<'a> {
    pub fn new(registry: &'a TemplateRegistry, prompts: &'a PromptResolver, max_depth: usize) -> Self {
        Self {
            registry,
            prompts,
            max_depth,
        }
    }

    pub fn consume(
        &self,
        body: &TemplateBody,
        rng: &mut dyn RandomSource,
    ) -> Result<Flattened, ResolveError> {
        self.consume_at(body, rng, 0)
    }

    fn consume_at(
        &self,
        body: &TemplateBody,
        rng: &mut dyn RandomSource,
        depth: usize,
    ) -> Result<Flattened, ResolveError> {
        self.check_depth(depth, "template consumption")?;

        let mut acc = Flattened::default();
        for reference in body.templates.iter().rev() {
            let template = self.select(reference, rng, depth)?;
            let flattened = self.consume_at(&template, rng, depth + 1)?;
            acc = self.merge(flattened, acc, rng)?;
        }

        self.merge(Flattened::from(body), acc, rng)
    }

    /// Turn one reference into a concrete body.
    pub fn select<'r>(
        &self,
        reference: &'r TemplateRef,
        rng: &mut dyn RandomSource,
        depth: usize,
    ) -> Result<Cow<'r, TemplateBody>, ResolveError>
    where
        'a: 'r,
    {
        self.check_depth(depth, "template reference selection")?;

        match reference {
            TemplateRef::Name(name) => self.lookup(name, rng),
            TemplateRef::OneOf(candidates) => {
                let weights: Vec<f64> = candidates.iter().map(|c| c.weight).collect();
                let picked = &candidates[rng.pick_weighted(&weights)?];
                self.select(&picked.reference, rng, depth + 1)
            }
            TemplateRef::Selectors(ops) => {
                let candidates = self.registry.select_tagged(ops);
                if candidates.is_empty() {
                    warn!(?ops, "tag selectors matched no templates");
                    return Ok(Cow::Owned(TemplateBody::default()));
                }
                let index = rng.pick_uniform(candidates.len());
                let name = candidates.iter().nth(index).cloned().unwrap_or_default();
                debug!(%name, pool = candidates.len(), "tag selectors picked template");
                self.lookup(&name, rng)
            }
            TemplateRef::Inline(body) => Ok(Cow::Borrowed(body.as_ref())),
        }
    }

    fn lookup<'r>(
        &self,
        name: &str,
        rng: &mut dyn RandomSource,
    ) -> Result<Cow<'r, TemplateBody>, ResolveError>
    where
        'a: 'r,
    {
        let name = Randomizer::apply(name, rng)?;
        match self.registry.get(&name) {
            Some(body) => Ok(Cow::Borrowed(body)),
            None => {
                debug!(%name, "template not found, using empty body");
                Ok(Cow::Owned(TemplateBody::default()))
            }
        }
    }

    /// Merge `target` ahead of `acc`.
    pub fn merge(
        &self,
        target: Flattened,
        acc: Flattened,
        rng: &mut dyn RandomSource,
    ) -> Result<Flattened, ResolveError> {
        let prompt = self.join(&target.prompt, &acc.prompt, rng)?;
        let negative_prompt = self.join(&target.negative_prompt, &acc.negative_prompt, rng)?;

        let mut prompt_elements = target.prompt_elements;
        prompt_elements.extend(acc.prompt_elements.into_iter().filter(|e| !e.is_empty()));

        let mut loras = target.loras;
        loras.extend(acc.loras.into_iter().filter(|l| !l.is_empty()));

        let mut fields = acc.fields;
        fields.extend(target.fields);

        Ok(Flattened {
            prompt,
            negative_prompt,
            prompt_elements,
            loras,
            fields,
        })
    }

    fn join(
        &self,
        target: &str,
        acc: &str,
        rng: &mut dyn RandomSource,
    ) -> Result<String, ResolveError> {
        let target = self.prompts.resolve(target, rng)?;
        let acc = self.prompts.resolve(acc, rng)?;
        Ok([target, acc]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(","))
    }

    fn check_depth(&self, depth: usize, context: &str) -> Result<(), ResolveError> {
        if depth > self.max_depth {
            return Err(ResolveError::RecursionLimit {
                limit: self.max_depth,
                context: context.to_string(),
            });
        }
        Ok(())
    }
}
