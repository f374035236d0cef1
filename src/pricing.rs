//! Model pricing, context windows and token estimation.
//!
//! Every model the scraper may call needs a [`Pricing`] entry: the budget
//! check before dispatch projects the cost of a call from an *estimated*
//! prompt size, and the accounting after the call prices the *actual* token
//! counts the backend reported. Both go through [`Pricing::cost`].
//!
//! Token estimation is deliberately cheap. Exact BPE counts depend on the
//! provider's tokenizer; a character ratio is close enough to size a context
//! window check and a cost projection, and it never under-counts images
//! because each attachment is charged a flat high-detail tile allowance.

use crate::config::ModelParams;
use crate::error::ScrapeError;
use crate::instructions::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Fixed per-message overhead (role markers, separators) in chat formats.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token allowance per attached image (one high-detail 512 px tile).
pub const IMAGE_TOKENS: usize = 765;

/// Counts tokens for a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `ceil(chars / chars_per_token)` estimator.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioCounter {
    pub chars_per_token: f32,
}

impl TokenCounter for CharRatioCounter {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count() as f32;
        (chars / self.chars_per_token.max(0.5)).ceil() as usize
    }
}

/// Price and capacity of one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Dollars per 1 000 prompt tokens.
    pub prompt_per_1k: f64,
    /// Dollars per 1 000 completion tokens.
    pub completion_per_1k: f64,
    /// Maximum prompt size in tokens.
    pub context_window: usize,
    /// Average characters per token, used by the default estimator.
    pub chars_per_token: f32,
}

impl Pricing {
    pub const fn new(prompt_per_1k: f64, completion_per_1k: f64, context_window: usize) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
            context_window,
            chars_per_token: 4.0,
        }
    }

    /// A free model (local inference) with the given window.
    pub const fn free(context_window: usize) -> Self {
        Self::new(0.0, 0.0, context_window)
    }

    /// Dollar cost of a call.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.prompt_per_1k
            + completion_tokens as f64 / 1000.0 * self.completion_per_1k
    }

    pub fn tokenizer(&self) -> CharRatioCounter {
        CharRatioCounter {
            chars_per_token: self.chars_per_token,
        }
    }
}

/// Model name → [`Pricing`].
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, Pricing>,
}

impl PricingTable {
    /// Prices for the models the scraper is commonly run with.
    pub fn builtin() -> Self {
        let entries = [
            ("gpt-3.5-turbo", Pricing::new(0.0005, 0.0015, 16_385)),
            ("gpt-3.5-turbo-0125", Pricing::new(0.0005, 0.0015, 16_385)),
            ("gpt-4", Pricing::new(0.03, 0.06, 8_192)),
            ("gpt-4-turbo-preview", Pricing::new(0.01, 0.03, 128_000)),
            ("gpt-4-vision-preview", Pricing::new(0.01, 0.03, 128_000)),
            ("gpt-4o", Pricing::new(0.0025, 0.01, 128_000)),
            ("gpt-4o-mini", Pricing::new(0.00015, 0.0006, 128_000)),
            ("gpt-4.1", Pricing::new(0.002, 0.008, 1_047_576)),
            ("gpt-4.1-mini", Pricing::new(0.0004, 0.0016, 1_047_576)),
            ("gpt-4.1-nano", Pricing::new(0.0001, 0.0004, 1_047_576)),
            ("mistral", Pricing::free(32_768)),
            ("llama3", Pricing::free(8_192)),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(name, p)| (name.to_string(), p))
                .collect(),
        }
    }

    pub fn get(&self, model: &str) -> Option<Pricing> {
        self.entries.get(model).copied()
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: Pricing) {
        self.entries.insert(model.into(), pricing);
    }

    /// Build a [`ModelSpec`] for a known model with default parameters.
    pub fn spec(&self, model: &str) -> Result<ModelSpec, ScrapeError> {
        let pricing = self.get(model).ok_or_else(|| {
            ScrapeError::InvalidConfig(format!(
                "no pricing known for model '{model}'; register it with PricingTable::insert \
                 or build a ModelSpec with explicit Pricing"
            ))
        })?;
        Ok(ModelSpec::new(model, pricing))
    }
}

/// A model identifier, its tunable parameters and its pricing entry.
#[derive(Clone)]
pub struct ModelSpec {
    pub name: String,
    pub params: ModelParams,
    pub pricing: Pricing,
    counter: Arc<dyn TokenCounter>,
}

impl std::fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, pricing: Pricing) -> Self {
        Self {
            name: name.into(),
            params: ModelParams::default(),
            counter: Arc::new(pricing.tokenizer()),
            pricing,
        }
    }

    /// Look the model up in [`PricingTable::builtin`].
    pub fn named(name: &str) -> Result<Self, ScrapeError> {
        PricingTable::builtin().spec(name)
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    /// Replace the default character-ratio estimator.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Effective context window: parameter override, else the table value.
    pub fn context_window(&self) -> usize {
        self.params
            .context_window
            .unwrap_or(self.pricing.context_window)
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Estimated prompt tokens for a composed message sequence.
    pub fn estimate_prompt_tokens(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| {
                self.count_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS + m.images.len() * IMAGE_TOKENS
            })
            .sum()
    }

    /// Upper bound on completion tokens used for cost projection:
    /// `max_output_tokens` when set, otherwise half the prompt.
    pub fn completion_upper_bound(&self, prompt_tokens: usize) -> usize {
        self.params
            .max_output_tokens
            .unwrap_or(prompt_tokens / 2)
    }

    /// Projected cost of sending `prompt_tokens`.
    pub fn project_cost(&self, prompt_tokens: usize) -> f64 {
        self.pricing.cost(
            prompt_tokens as u64,
            self.completion_upper_bound(prompt_tokens) as u64,
        )
    }
}

/// Rough dollar estimate for sending `document` to `model`.
///
/// Assumes the reply is half as long as the prompt, which is only a rule of
/// thumb. Useful to decide between models before building a scraper.
pub fn cost_estimate(document: &str, model: &str) -> Result<f64, ScrapeError> {
    let spec = ModelSpec::named(model)?;
    let tokens = spec.count_tokens(document) as u64;
    Ok(spec.pricing.cost(tokens, tokens / 2))
}
