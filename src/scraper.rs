//! Extraction orchestrator.
//!
//! A [`Scraper`] is built once per (schema, template, model list) and serves
//! many extractions. Each `scrape*` call runs this sequence:
//!
//! ```text
//! document ──► split? ──► per chunk (≤ chunk_concurrency in flight):
//!                           compose messages
//!                           pick model (index 0, or escalate on oversize)
//!                           context-window check ── InputTooLarge
//!                           reserve projected cost ── BudgetExceeded
//!                           send under RetryPolicy
//!                           charge reply, parse payload
//!          ◄── merge payloads in chunk order ◄──┘
//!          ──► postprocessor chain (once) ──► ScrapeResponse
//! ```
//!
//! ## Accounting
//!
//! Every reply the backend returns is charged and recorded, including the
//! truncated and malformed ones that get retried. A call that returns
//! nothing (transport failure, timeout, refused reservation) records nothing.
//! Whenever the extraction fails, the error carries the response accumulated
//! so far, so spend is never hidden from the caller.
//!
//! ## Concurrency
//!
//! Chunks run through `futures::stream::buffered`, so results come back in
//! chunk order. On the first failure a child cancellation token is cancelled:
//! chunks not yet started never dispatch and sibling retry waits end at once.
//! Calls already in flight are awaited, so their replies are charged and
//! their budget reservations released before the error is returned.

use crate::backend::ModelBackend;
use crate::budget::Ledger;
use crate::chunk::{merge_payloads, split_document};
use crate::config::{Escalation, ScraperConfig};
use crate::error::{BackendError, ScrapeError};
use crate::instructions::{compose_messages, ImageRef, Instructions, Message, Schema};
use crate::postprocess::{extract_json, Postprocessor, PostprocessorChain};
use crate::pricing::ModelSpec;
use crate::response::{ApiResponse, Data, ScrapeResponse};
use crate::retry::{Attempt, RetryFailure};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Read-only view ───────────────────────────────────────────────────────────

/// Read-only view of a [`Scraper`]'s configuration, handed to postprocessors.
///
/// Holds shared references only and exposes no budget state, so a
/// postprocessor has no way to alter instructions or accounting.
#[derive(Debug, Clone, Copy)]
pub struct ScraperView<'a> {
    pub schema: &'a Schema,
    pub instructions: &'a Instructions,
    pub config: &'a ScraperConfig,
}

impl<'a> ScraperView<'a> {
    /// Configured models in escalation order.
    pub fn models(&self) -> &'a [ModelSpec] {
        &self.config.models
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

/// One extraction request: the document plus optional context.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    document: Arc<str>,
    url: Option<String>,
    image: Option<ImageRef>,
    auto_split_length: Option<usize>,
}

impl ScrapeRequest {
    pub fn new(document: impl Into<Arc<str>>) -> Self {
        Self {
            document: document.into(),
            url: None,
            image: None,
            auto_split_length: None,
        }
    }

    /// Page the document came from; copied into the response.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Attach a visual rendering of the page (vision variant).
    pub fn image(mut self, image: ImageRef) -> Self {
        self.image = Some(image);
        self
    }

    /// Override the configured split threshold for this request only.
    pub fn auto_split_length(mut self, chars: usize) -> Self {
        self.auto_split_length = Some(chars);
        self
    }
}

// ── Scraper ──────────────────────────────────────────────────────────────────

/// Schema-driven extractor over a [`ModelBackend`].
pub struct Scraper {
    schema: Schema,
    instructions: Instructions,
    config: ScraperConfig,
    backend: Arc<dyn ModelBackend>,
    chain: PostprocessorChain,
}

impl fmt::Debug for Scraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scraper")
            .field("schema", &self.schema)
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("chain", &self.chain)
            .finish()
    }
}

/// Builder for [`Scraper`].
pub struct ScraperBuilder {
    schema: Schema,
    template: String,
    config: Option<ScraperConfig>,
    backend: Option<Arc<dyn ModelBackend>>,
    chain: PostprocessorChain,
}

impl ScraperBuilder {
    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(mut self, config: ScraperConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Append a postprocessing step; steps run in the order added.
    pub fn postprocessor(mut self, step: impl Postprocessor + 'static) -> Self {
        self.chain.push(step);
        self
    }

    pub fn postprocessors(mut self, chain: PostprocessorChain) -> Self {
        self.chain = chain;
        self
    }

    /// Render the instructions and assemble the scraper.
    pub fn build(self) -> Result<Scraper, ScrapeError> {
        let backend = self
            .backend
            .ok_or_else(|| ScrapeError::InvalidConfig("no model backend configured".into()))?;
        let config = match self.config {
            Some(c) => c,
            None => ScraperConfig::builder().build()?,
        };
        if config.models.is_empty() {
            return Err(ScrapeError::InvalidConfig("model list is empty".into()));
        }
        if config.models.len() > 1 && config.escalation == Escalation::Never {
            warn!(
                "{} models configured without escalation; only '{}' will be called",
                config.models.len(),
                config.models[0].name
            );
        }
        let instructions = Instructions::render(&self.template, &self.schema);
        Ok(Scraper {
            schema: self.schema,
            instructions,
            config,
            backend,
            chain: self.chain,
        })
    }
}

impl Scraper {
    /// Start building a scraper for `schema` with the given instruction template.
    pub fn builder(schema: Schema, template: impl Into<String>) -> ScraperBuilder {
        ScraperBuilder {
            schema,
            template: template.into(),
            config: None,
            backend: None,
            chain: PostprocessorChain::new(),
        }
    }

    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    pub fn view(&self) -> ScraperView<'_> {
        ScraperView {
            schema: &self.schema,
            instructions: &self.instructions,
            config: &self.config,
        }
    }

    /// Text-only extraction.
    pub async fn scrape(&self, document: &str) -> Result<ScrapeResponse, ScrapeError> {
        self.scrape_request(ScrapeRequest::new(document), &CancellationToken::new())
            .await
    }

    /// Extraction with a screenshot of the page attached to every call.
    pub async fn scrape_with_image(
        &self,
        document: &str,
        image: ImageRef,
    ) -> Result<ScrapeResponse, ScrapeError> {
        self.scrape_request(
            ScrapeRequest::new(document).image(image),
            &CancellationToken::new(),
        )
        .await
    }

    /// General form: URL, image and split override, with cancellation.
    pub async fn scrape_request(
        &self,
        request: ScrapeRequest,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResponse, ScrapeError> {
        if request.document.trim().is_empty() {
            return Err(ScrapeError::EmptyDocument);
        }
        if request.image.is_some() && !self.backend.supports_vision() {
            return Err(ScrapeError::InvalidConfig(format!(
                "backend '{}' does not accept images",
                self.backend.name()
            )));
        }

        let split_len = request.auto_split_length.or(self.config.auto_split_length);
        let mut base = ScrapeResponse {
            url: request.url.clone(),
            document: Some(Arc::clone(&request.document)),
            auto_split_length: split_len,
            ..Default::default()
        };

        let document: &str = &request.document;
        let chunks = match split_len {
            Some(limit) if document.chars().count() > limit => split_document(document, limit),
            _ => vec![document],
        };
        info!(
            "Extracting {} chars in {} chunk(s) via '{}' (ceiling ${:.4})",
            document.chars().count(),
            chunks.len(),
            self.backend.name(),
            self.config.max_cost
        );

        let ledger = Ledger::new(self.config.max_cost, self.config.shared_budget.clone());
        let child = cancel.child_token();
        let image = request.image.as_ref();

        let mut results = stream::iter(chunks.iter().enumerate().map(|(index, chunk)| {
            self.run_chunk(index, chunk, image, &ledger, &child)
        }))
        .buffered(self.config.chunk_concurrency.max(1));

        let mut payloads = Vec::with_capacity(chunks.len());
        let mut failure: Option<ScrapeError> = None;
        while let Some(result) = results.next().await {
            match (result, failure.is_some()) {
                (Ok(data), false) => payloads.push(data),
                (Err(e), false) => {
                    // Stop new dispatches; calls already sent still finish and
                    // are charged below.
                    child.cancel();
                    failure = Some(e);
                }
                (Ok(_), true) => {}
                (Err(e), true) => debug!("Chunk ended after abort: {}", e.kind()),
            }
        }
        drop(results);

        base.response = ledger.snapshot().await;
        if let Some(e) = failure {
            warn!(
                "Extraction failed ({}) after ${:.4} spent",
                e.kind(),
                base.response.total_cost
            );
            return Err(e.with_response(base));
        }
        base.response.data = match merge_payloads(payloads, &self.config.merge_policy) {
            Ok(data) => data,
            Err(detail) => {
                return Err(ScrapeError::MergeAmbiguity {
                    detail,
                    response: Box::new(base),
                })
            }
        };

        let response = match self.chain.apply(base.clone(), &self.view()) {
            Ok(r) => r,
            Err(e) => {
                return Err(ScrapeError::Postprocessing {
                    step: e.step,
                    detail: e.detail,
                    response: Box::new(base),
                })
            }
        };

        info!(
            "Extraction done: {} call(s), {} prompt + {} completion tokens, ${:.4}{}",
            response.api_responses().len(),
            response.response.total_prompt_tokens,
            response.response.total_completion_tokens,
            response.total_cost(),
            if response.response.over_budget { " (over budget)" } else { "" }
        );
        Ok(response)
    }

    // ── Per-chunk pipeline ───────────────────────────────────────────────────

    /// First model whose context window fits `messages`, honouring the
    /// escalation policy. Returns the model and the estimated prompt size.
    fn select_model(&self, messages: &[Message]) -> Result<(&ModelSpec, usize), ScrapeError> {
        let candidates = match self.config.escalation {
            Escalation::Never => &self.config.models[..1],
            Escalation::OnInputTooLarge => &self.config.models[..],
        };
        let mut last = None;
        for model in candidates {
            let tokens = model.estimate_prompt_tokens(messages);
            if tokens <= model.context_window() {
                return Ok((model, tokens));
            }
            debug!(
                "'{}': ~{} tokens exceeds window of {}",
                model.name,
                tokens,
                model.context_window()
            );
            last = Some((model, tokens));
        }
        let (model, tokens) = last.ok_or_else(|| ScrapeError::InvalidConfig("model list is empty".into()))?;
        Err(ScrapeError::InputTooLarge {
            model: model.name.clone(),
            tokens,
            limit: model.context_window(),
            response: Box::default(),
        })
    }

    async fn run_chunk(
        &self,
        index: usize,
        chunk: &str,
        image: Option<&ImageRef>,
        ledger: &Ledger,
        cancel: &CancellationToken,
    ) -> Result<Data, ScrapeError> {
        if cancel.is_cancelled() {
            return Err(ScrapeError::Cancelled {
                response: Box::default(),
            });
        }
        let messages = compose_messages(
            &self.instructions,
            &self.config.extra_instructions,
            chunk,
            image,
        );
        let (model, prompt_tokens) = self.select_model(&messages)?;
        let projected = model.project_cost(prompt_tokens);
        debug!(
            "Chunk {}: '{}' ~{} prompt tokens, projected ${:.6}",
            index, model.name, prompt_tokens, projected
        );

        let messages = &messages;
        let outcome = self
            .config
            .retry
            .run(cancel, move |_attempt| async move {
                if cancel.is_cancelled() {
                    return Attempt::Fatal(ScrapeError::Cancelled {
                        response: Box::default(),
                    });
                }
                if let Err(breach) = ledger.reserve(projected).await {
                    warn!(
                        "Budget refused chunk {} ({}): spent ${:.4}, next ~${:.4}, ceiling ${:.4}",
                        index, breach.phase, breach.total_cost, breach.projected, breach.max_cost
                    );
                    return Attempt::Fatal(ScrapeError::BudgetExceeded {
                        phase: breach.phase,
                        projected: breach.projected,
                        total_cost: breach.total_cost,
                        max_cost: breach.max_cost,
                        response: Box::default(),
                    });
                }
                self.attempt(index, model, messages, ledger, projected).await
            })
            .await;

        outcome.map_err(|failure| match failure {
            RetryFailure::Fatal(e) => e,
            RetryFailure::Cancelled => ScrapeError::Cancelled {
                response: Box::default(),
            },
            RetryFailure::Exhausted { attempts, last } => {
                let model = model.name.clone();
                let response = Box::default();
                match last {
                    BackendError::Truncated { .. } => ScrapeError::TruncatedOutput {
                        model,
                        attempts,
                        response,
                    },
                    BackendError::Malformed(detail) => ScrapeError::MalformedOutput {
                        model,
                        attempts,
                        detail,
                        response,
                    },
                    other @ (BackendError::Transport(_) | BackendError::Timeout { .. }) => {
                        ScrapeError::BackendTransport {
                            model,
                            attempts,
                            detail: other.to_string(),
                            response,
                        }
                    }
                }
            }
        })
    }

    /// One dispatch with a reservation already held.
    async fn attempt(
        &self,
        index: usize,
        model: &ModelSpec,
        messages: &[Message],
        ledger: &Ledger,
        reserved: f64,
    ) -> Attempt<Data, ScrapeError> {
        let start = Instant::now();
        let call = self.backend.send(model, messages);
        let sent = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(BackendError::Timeout {
                    secs: limit.as_secs(),
                }),
            },
            None => call.await,
        };
        let reply = match sent {
            Ok(reply) => reply,
            Err(e) => {
                ledger.release(reserved).await;
                return Attempt::Retry(e);
            }
        };

        let cost = model.pricing.cost(reply.prompt_tokens, reply.completion_tokens);
        debug!(
            "Chunk {}: '{}' {} prompt + {} completion tokens, ${:.6}, {:?}",
            index, model.name, reply.prompt_tokens, reply.completion_tokens, cost, reply.finish
        );
        let truncated = reply.finish.is_truncation();
        let completion_tokens = reply.completion_tokens;
        let payload = if truncated {
            None
        } else if self.config.require_json {
            extract_json(&reply.content).map(Data::from_value)
        } else {
            Some(Data::Text(reply.content.clone()))
        };

        ledger
            .charge(
                ApiResponse {
                    model: model.name.clone(),
                    content: reply.content,
                    prompt_tokens: reply.prompt_tokens,
                    completion_tokens: reply.completion_tokens,
                    cost,
                    finish: reply.finish,
                    duration_ms: start.elapsed().as_millis() as u64,
                    chunk: index,
                },
                reserved,
            )
            .await;

        if truncated {
            return Attempt::Retry(BackendError::Truncated { completion_tokens });
        }
        match payload {
            Some(data) => Attempt::Done(data),
            None => Attempt::Retry(BackendError::Malformed(
                "reply contains no JSON value".into(),
            )),
        }
    }
}
