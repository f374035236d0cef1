//! # edgequake-scrape
//!
//! Extract schema-shaped JSON from web pages using Large Language Models.
//!
//! ## Why this crate?
//!
//! Hand-written scrapers break every time a page layout changes. Describing
//! *what* to extract (a schema) and letting an LLM read the page is far more
//! robust, but it moves the risk elsewhere: a runaway document can burn
//! through an API budget, providers fail transiently, and models return
//! prose or invented values instead of the requested JSON. This crate is the
//! orchestration layer that makes such extraction safe to run unattended:
//! hard cost ceilings, bounded retries, chunking of oversized documents, and a
//! postprocessing chain, with every dollar spent accounted for even when an
//! extraction fails.
//!
//! ## Pipeline Overview
//!
//! ```text
//! page
//!  │
//!  ├─ 1. Source   fetch + reduce HTML (optional screenshot upload)
//!  ├─ 2. Compose  frozen instructions + extra instructions + document
//!  ├─ 3. Guard    context-window check, projected cost vs. ceiling
//!  ├─ 4. Call     ModelBackend under RetryPolicy, every reply charged
//!  ├─ 5. Merge    chunk payloads in order (when the document was split)
//!  └─ 6. Polish   postprocessor chain (JSON salvage, schema, hallucinations)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_scrape::{
//!     JsonPostprocessor, ProviderBackend, Schema, Scraper, ScraperConfig,
//!     DEFAULT_TEXT_PROMPT,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Schema::try_from(serde_json::json!([{"plan": "string", "price": "string"}]))?;
//!     let config = ScraperConfig::builder()
//!         .models(["gpt-4o-mini"])
//!         .max_cost(0.05)
//!         .build()?;
//!     let backend = ProviderBackend::resolve(Some("openai"), &config.models)?;
//!     let scraper = Scraper::builder(schema, DEFAULT_TEXT_PROMPT)
//!         .config(config)
//!         .backend(Arc::new(backend))
//!         .postprocessor(JsonPostprocessor)
//!         .build()?;
//!
//!     let response = scraper.scrape("Pro plan: $10/month. Team plan: $25/month.").await?;
//!     println!("{}", serde_json::to_string_pretty(response.data())?);
//!     eprintln!("spent ${:.4}", response.total_cost());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `web2json` binary (clap + anyhow + tracing-subscriber) |
//! | `upload` | via cli | Public screenshot upload to S3-compatible storage (aws-sdk-s3) |
//!
//! Disable default features when using only the library:
//! ```toml
//! edgequake-scrape = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod budget;
pub mod chunk;
pub mod config;
pub mod error;
pub mod instructions;
pub mod output;
pub mod postprocess;
pub mod pricing;
pub mod response;
pub mod retry;
pub mod scraper;
pub mod source;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{BackendReply, ModelBackend, ProviderBackend};
pub use budget::{Budget, SharedBudget};
pub use config::{Escalation, MergePolicy, ModelParams, ScraperConfig, ScraperConfigBuilder};
pub use error::{BackendError, BudgetPhase, PostprocessError, ScrapeError};
pub use instructions::{
    ImageRef, Instructions, Message, Role, Schema, DEFAULT_TEXT_PROMPT, DEFAULT_VISION_PROMPT,
};
pub use output::{persist_data, ScrapeVariant};
pub use postprocess::{
    HallucinationChecker, JsonPostprocessor, Postprocessor, PostprocessorChain, SchemaValidator,
};
pub use pricing::{cost_estimate, ModelSpec, Pricing, PricingTable, TokenCounter};
pub use response::{ApiResponse, Data, FinishReason, Response, ScrapeResponse};
pub use retry::RetryPolicy;
pub use scraper::{ScrapeRequest, Scraper, ScraperBuilder, ScraperView};
pub use tokio_util::sync::CancellationToken;
