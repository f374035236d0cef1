//! Configuration types for schema extraction.
//!
//! Everything that shapes an extraction apart from the schema, the template
//! and the backend lives in [`ScraperConfig`], built via its
//! [`ScraperConfigBuilder`]. Defaults mirror the behaviour the scraper has
//! always had: `gpt-3.5-turbo`, temperature 0, a $1 ceiling, and one retry
//! after 30 seconds.

use crate::budget::SharedBudget;
use crate::error::ScrapeError;
use crate::pricing::ModelSpec;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Tunable per-model request parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Sampling temperature. Default: 0.0 (deterministic extraction).
    pub temperature: f32,
    /// Cap on completion tokens. Also the completion upper bound used for
    /// the pre-dispatch cost projection.
    pub max_output_tokens: Option<usize>,
    /// Override of the pricing table's context window.
    pub context_window: Option<usize>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_output_tokens: None,
            context_window: None,
        }
    }
}

/// What to do with the models after index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Escalation {
    /// Always call the first model; the rest of the list is unused. (default)
    #[default]
    Never,
    /// Move to the next model when the input does not fit the current
    /// model's context window. Decided before dispatch, so no spend is lost.
    OnInputTooLarge,
}

/// How chunk payloads are combined when a document is split.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Every chunk must yield a list; lists are concatenated in order. (default)
    #[default]
    ListConcat,
    /// Every chunk is rendered as text and joined with the separator.
    TextJoin(String),
    /// Every chunk must yield a mapping; keys are unioned and a key seen
    /// twice with different values is an error.
    ObjectUnion,
}

/// Configuration for a [`crate::Scraper`].
#[derive(Clone)]
pub struct ScraperConfig {
    /// Models in escalation order, cheapest first.
    pub models: Vec<ModelSpec>,

    /// Dollar ceiling for one extraction (or for the shared budget's
    /// lifetime when `shared_budget` is set). Default: 1.0.
    pub max_cost: f64,

    /// Retry rule applied around each backend call. Default: 1 retry, 30 s wait.
    pub retry: RetryPolicy,

    /// Additional system messages sent after the rendered instructions.
    pub extra_instructions: Vec<String>,

    /// Model escalation policy. Default: [`Escalation::Never`].
    pub escalation: Escalation,

    /// Split documents longer than this many characters. Default: None.
    pub auto_split_length: Option<usize>,

    /// Chunk calls in flight at once. Default: 4.
    pub chunk_concurrency: usize,

    /// Merge rule for chunk payloads. Default: [`MergePolicy::ListConcat`].
    pub merge_policy: MergePolicy,

    /// Require each reply to contain a JSON value; otherwise the attempt is
    /// treated as malformed and retried. Default: true.
    pub require_json: bool,

    /// Per-call timeout. Default: 120 s.
    pub call_timeout: Option<Duration>,

    /// Cumulative accounting across extractions. Default: None
    /// (each extraction is budgeted on its own).
    pub shared_budget: Option<SharedBudget>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            max_cost: 1.0,
            retry: RetryPolicy::default(),
            extra_instructions: Vec::new(),
            escalation: Escalation::default(),
            auto_split_length: None,
            chunk_concurrency: 4,
            merge_policy: MergePolicy::default(),
            require_json: true,
            call_timeout: Some(Duration::from_secs(120)),
            shared_budget: None,
        }
    }
}

impl fmt::Debug for ScraperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScraperConfig")
            .field(
                "models",
                &self.models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            )
            .field("max_cost", &self.max_cost)
            .field("retry", &self.retry)
            .field("extra_instructions", &self.extra_instructions.len())
            .field("escalation", &self.escalation)
            .field("auto_split_length", &self.auto_split_length)
            .field("chunk_concurrency", &self.chunk_concurrency)
            .field("merge_policy", &self.merge_policy)
            .field("require_json", &self.require_json)
            .field("call_timeout", &self.call_timeout)
            .field("shared_budget", &self.shared_budget.is_some())
            .finish()
    }
}

impl ScraperConfig {
    /// Create a new builder for `ScraperConfig`.
    pub fn builder() -> ScraperConfigBuilder {
        ScraperConfigBuilder {
            config: Self::default(),
            model_names: Vec::new(),
        }
    }
}

/// Builder for [`ScraperConfig`].
#[derive(Debug)]
pub struct ScraperConfigBuilder {
    config: ScraperConfig,
    model_names: Vec<String>,
}

impl ScraperConfigBuilder {
    /// Append a fully specified model.
    pub fn model(mut self, spec: ModelSpec) -> Self {
        self.config.models.push(spec);
        self
    }

    /// Append models from the built-in pricing table by name.
    pub fn models<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn max_cost(mut self, dollars: f64) -> Self {
        self.config.max_cost = dollars;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn extra_instruction(mut self, text: impl Into<String>) -> Self {
        self.config.extra_instructions.push(text.into());
        self
    }

    pub fn escalation(mut self, policy: Escalation) -> Self {
        self.config.escalation = policy;
        self
    }

    pub fn auto_split_length(mut self, chars: usize) -> Self {
        self.config.auto_split_length = Some(chars);
        self
    }

    pub fn chunk_concurrency(mut self, n: usize) -> Self {
        self.config.chunk_concurrency = n.max(1);
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.config.merge_policy = policy;
        self
    }

    pub fn require_json(mut self, v: bool) -> Self {
        self.config.require_json = v;
        self
    }

    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn shared_budget(mut self, budget: SharedBudget) -> Self {
        self.config.shared_budget = Some(budget);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ScraperConfig, ScrapeError> {
        let mut config = self.config;
        for name in &self.model_names {
            config.models.push(ModelSpec::named(name)?);
        }
        if config.models.is_empty() {
            config.models.push(ModelSpec::named("gpt-3.5-turbo")?);
        }
        if !config.max_cost.is_finite() || config.max_cost < 0.0 {
            return Err(ScrapeError::InvalidConfig(format!(
                "max_cost must be a non-negative number, got {}",
                config.max_cost
            )));
        }
        if config.auto_split_length == Some(0) {
            return Err(ScrapeError::InvalidConfig(
                "auto_split_length must be ≥ 1".into(),
            ));
        }
        for m in &config.models {
            if !(0.0..=2.0).contains(&m.params.temperature) {
                return Err(ScrapeError::InvalidConfig(format!(
                    "temperature for '{}' must be 0–2, got {}",
                    m.name, m.params.temperature
                )));
            }
        }
        Ok(config)
    }
}
