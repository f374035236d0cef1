//! Integration tests for the extraction orchestrator.
//!
//! Every test drives a [`Scripted`] backend: an in-process `ModelBackend`
//! whose replies are computed from the call number and the document chunk it
//! receives. No network access or API key is needed.
//!
//! Run with:
//!   cargo test --test scrape -- --nocapture

use async_trait::async_trait;
use edgequake_scrape::{
    BackendError, BackendReply, BudgetPhase, CancellationToken, Data, FinishReason, ImageRef,
    JsonPostprocessor, MergePolicy, Message, ModelBackend, ModelSpec, PostprocessError,
    Postprocessor, Pricing, RetryPolicy, Role, Schema, ScrapeError, ScrapeRequest,
    ScrapeResponse, Scraper, ScraperConfig, ScraperConfigBuilder, ScraperView, SharedBudget,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

// ── Test helpers ─────────────────────────────────────────────────────────────

type Script = dyn Fn(usize, &str) -> Result<BackendReply, BackendError> + Send + Sync;

struct Scripted {
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
    script: Box<Script>,
    delay: Option<fn(&str) -> Duration>,
}

impl Scripted {
    fn new(
        script: impl Fn(usize, &str) -> Result<BackendReply, BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            script: Box::new(script),
            delay: None,
        })
    }

    fn with_delay(
        delay: fn(&str) -> Duration,
        script: impl Fn(usize, &str) -> Result<BackendReply, BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            script: Box::new(script),
            delay: Some(delay),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(
        &self,
        _model: &ModelSpec,
        messages: &[Message],
    ) -> Result<BackendReply, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let user = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay(&user)).await;
        }
        (self.script)(n, &user)
    }
}

fn reply(content: &str, prompt_tokens: u64, completion_tokens: u64) -> Result<BackendReply, BackendError> {
    Ok(BackendReply {
        content: content.to_string(),
        prompt_tokens,
        completion_tokens,
        finish: FinishReason::Stop,
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("edgequake_scrape=debug"))
        .with_test_writer()
        .try_init();
}

fn test_model(pricing: Pricing) -> ModelSpec {
    ModelSpec::new("test-model", pricing)
}

fn config(pricing: Pricing) -> ScraperConfigBuilder {
    ScraperConfig::builder()
        .model(test_model(pricing))
        .retry(RetryPolicy::none())
}

fn cheap() -> Pricing {
    Pricing::new(0.001, 0.002, 100_000)
}

fn scraper(backend: Arc<Scripted>, config: ScraperConfig) -> Scraper {
    Scraper::builder(Schema::Text("items".into()), "Extract {schema}")
        .config(config)
        .backend(backend)
        .build()
        .unwrap()
}

// ── Chunking ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_short_document_is_one_call() {
    init_tracing();
    let backend = Scripted::new(|_, _| reply(r#"["a"]"#, 100, 10));
    let s = scraper(backend.clone(), config(cheap()).auto_split_length(2000).build().unwrap());

    let r = assert_ok!(s.scrape("short page").await);
    assert_eq!(backend.calls(), 1);
    assert_eq!(r.api_responses().len(), 1);
    assert_eq!(r.data(), &Data::List(vec![json!("a")]));
    assert_eq!(r.auto_split_length, Some(2000));
}

#[tokio::test]
async fn test_5000_chars_split_at_2000_makes_three_calls() {
    init_tracing();
    let backend = Scripted::new(|_, chunk| reply(&format!("[{}]", chunk.len()), 600, 5));
    let s = scraper(backend.clone(), config(cheap()).auto_split_length(2000).build().unwrap());

    let r = assert_ok!(s.scrape(&"A".repeat(5000)).await);
    assert_eq!(backend.calls(), 3);
    assert_eq!(r.api_responses().len(), 3);
    assert_eq!(r.data(), &Data::List(vec![json!(2000), json!(2000), json!(1000)]));
    let chunks: Vec<usize> = r.api_responses().iter().map(|a| a.chunk).collect();
    let mut sorted = chunks.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2]);
    assert_eq!(r.response.total_prompt_tokens, 1800);
}

#[tokio::test]
async fn test_concurrent_chunks_merge_in_chunk_order() {
    // First chunk is slowest, so completion order is the reverse of chunk order.
    let backend = Scripted::with_delay(
        |chunk| match chunk.chars().next() {
            Some('a') => Duration::from_millis(60),
            Some('b') => Duration::from_millis(30),
            _ => Duration::from_millis(0),
        },
        |_, chunk| reply(&format!(r#"["{}"]"#, &chunk[..1]), 10, 1),
    );
    let doc = format!("{}{}{}", "a".repeat(100), "b".repeat(100), "c".repeat(50));
    let s = scraper(
        backend.clone(),
        config(cheap())
            .auto_split_length(100)
            .chunk_concurrency(4)
            .build()
            .unwrap(),
    );

    let r = assert_ok!(s.scrape(&doc).await);
    assert_eq!(r.data(), &Data::List(vec![json!("a"), json!("b"), json!("c")]));
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_per_request_split_override() {
    let backend = Scripted::new(|_, _| reply("[]", 1, 1));
    let s = scraper(backend.clone(), config(cheap()).build().unwrap());

    let request = ScrapeRequest::new("x".repeat(30)).auto_split_length(10);
    let r = assert_ok!(s.scrape_request(request, &CancellationToken::new()).await);
    assert_eq!(backend.calls(), 3);
    assert_eq!(r.auto_split_length, Some(10));
}

#[tokio::test]
async fn test_merge_ambiguity_keeps_spend() {
    let backend = Scripted::new(|n, _| {
        if n == 0 {
            reply("[1]", 100, 10)
        } else {
            reply(r#"{"a": 1}"#, 100, 10)
        }
    });
    let s = scraper(
        backend.clone(),
        config(cheap())
            .auto_split_length(5)
            .chunk_concurrency(1)
            .merge_policy(MergePolicy::ListConcat)
            .build()
            .unwrap(),
    );

    let err = assert_err!(s.scrape("0123456789").await);
    assert_eq!(err.kind(), "merge_ambiguity");
    let partial = err.response().unwrap();
    assert_eq!(partial.api_responses().len(), 2);
    assert!(err.spend() > 0.0);
}

#[tokio::test]
async fn test_object_union_merge() {
    let backend = Scripted::new(|n, _| reply(&format!(r#"{{"k{n}": {n}}}"#), 10, 1));
    let s = scraper(
        backend,
        config(cheap())
            .auto_split_length(5)
            .chunk_concurrency(1)
            .merge_policy(MergePolicy::ObjectUnion)
            .build()
            .unwrap(),
    );

    let r = assert_ok!(s.scrape("0123456789").await);
    assert_eq!(r.data().to_value(), json!({"k0": 0, "k1": 1}));
}

// ── Budget ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_projected_breach_dispatches_nothing() {
    init_tracing();
    let backend = Scripted::new(|_, _| reply("[]", 1, 1));
    // $1 per 1k tokens: ~37 prompt tokens project to ~$0.05.
    let s = scraper(
        backend.clone(),
        config(Pricing::new(1.0, 1.0, 100_000))
            .max_cost(0.01)
            .build()
            .unwrap(),
    );

    let err = assert_err!(s.scrape(&"x".repeat(100)).await);
    match &err {
        ScrapeError::BudgetExceeded {
            phase,
            projected,
            max_cost,
            response,
            ..
        } => {
            assert_eq!(*phase, BudgetPhase::Projected);
            assert!(*projected > *max_cost);
            assert!(response.api_responses().is_empty());
            assert_eq!(response.total_cost(), 0.0);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_breaching_call_is_accepted_and_flagged() {
    // Projection is tiny, but the backend reports 5000 prompt tokens ($0.05).
    let backend = Scripted::new(|_, _| reply("[1]", 5000, 0));
    let s = scraper(
        backend.clone(),
        config(Pricing::new(0.01, 0.01, 100_000))
            .max_cost(0.02)
            .build()
            .unwrap(),
    );

    let r = assert_ok!(s.scrape("tiny").await);
    assert!(r.response.over_budget);
    let breaching = r.api_responses()[0].cost;
    assert!(r.total_cost() <= 0.02 + breaching + 1e-12);
    assert!((r.total_cost() - 0.05).abs() < 1e-12);
}

#[tokio::test]
async fn test_no_dispatch_after_incurred_breach() {
    let backend = Scripted::new(|_, _| reply("[1]", 5000, 0));
    let s = scraper(
        backend.clone(),
        config(Pricing::new(0.01, 0.01, 100_000))
            .max_cost(0.02)
            .auto_split_length(10)
            .chunk_concurrency(1)
            .build()
            .unwrap(),
    );

    let err = assert_err!(s.scrape(&"a".repeat(30)).await);
    match &err {
        ScrapeError::BudgetExceeded { phase, response, .. } => {
            assert_eq!(*phase, BudgetPhase::Incurred);
            assert_eq!(response.api_responses().len(), 1);
            assert!(response.response.over_budget);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(backend.calls(), 1);
    assert!((err.spend() - 0.05).abs() < 1e-12);
}

#[tokio::test]
async fn test_shared_budget_spans_extractions() {
    let shared = SharedBudget::new(0.08);
    let backend = Scripted::new(|_, _| reply("[1]", 5000, 0));
    let s = scraper(
        backend.clone(),
        config(Pricing::new(0.01, 0.01, 100_000))
            .max_cost(0.08)
            .shared_budget(shared.clone())
            .build()
            .unwrap(),
    );

    let first = assert_ok!(s.scrape("page one").await);
    assert!(!first.response.over_budget);
    let second = assert_ok!(s.scrape("page two").await);
    // Per-extraction totals stay per extraction; the lifetime cap is crossed.
    assert!((second.total_cost() - 0.05).abs() < 1e-12);
    assert!(second.response.over_budget);

    let err = assert_err!(s.scrape("page three").await);
    assert_eq!(err.kind(), "budget_exceeded");
    assert_eq!(backend.calls(), 2);

    let lifetime = shared.snapshot().await;
    assert_eq!(lifetime.total_prompt_tokens, 10_000);
    assert!(lifetime.over_budget);
}

#[tokio::test]
async fn test_input_too_large_dispatches_nothing() {
    let backend = Scripted::new(|_, _| reply("[]", 1, 1));
    let s = scraper(
        backend.clone(),
        config(Pricing::new(0.001, 0.002, 10)).build().unwrap(),
    );

    let err = assert_err!(s.scrape(&"word ".repeat(200)).await);
    match &err {
        ScrapeError::InputTooLarge {
            tokens,
            limit,
            response,
            ..
        } => {
            assert_eq!(*limit, 10);
            assert!(*tokens > 10);
            assert!(response.api_responses().is_empty());
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(backend.calls(), 0);
    assert_eq!(err.spend(), 0.0);
}

// ── Partial failure ──────────────────────────────────────────────────────────

/// Chunks starting with 'a' fail fast; every other chunk answers after 200ms.
fn fast_failure_slow_sibling() -> Arc<Scripted> {
    Scripted::with_delay(
        |chunk| {
            if chunk.starts_with('a') {
                Duration::from_millis(50)
            } else {
                Duration::from_millis(200)
            }
        },
        |_, chunk| {
            if chunk.starts_with('a') {
                Err(BackendError::Transport("502".into()))
            } else {
                reply("[1]", 1000, 0)
            }
        },
    )
}

#[tokio::test]
async fn test_in_flight_sibling_is_charged_after_failure() {
    init_tracing();
    let backend = fast_failure_slow_sibling();
    let s = scraper(
        backend.clone(),
        config(cheap())
            .auto_split_length(10)
            .chunk_concurrency(2)
            .build()
            .unwrap(),
    );
    let doc = format!("{}{}{}", "a".repeat(10), "b".repeat(10), "c".repeat(10));

    let err = assert_err!(s.scrape(&doc).await);
    assert_eq!(err.kind(), "backend_transport");
    // Chunk 2 was queued behind the failure and never sent.
    assert_eq!(backend.calls(), 2);
    let partial = err.response().unwrap();
    assert_eq!(partial.api_responses().len(), 1);
    assert_eq!(partial.api_responses()[0].chunk, 1);
    assert!((err.spend() - 0.001).abs() < 1e-12);
}

#[tokio::test]
async fn test_partial_failure_leaves_no_shared_reservation() {
    let shared = SharedBudget::new(0.05);
    let backend = fast_failure_slow_sibling();
    let s = scraper(
        backend.clone(),
        config(cheap())
            .auto_split_length(10)
            .chunk_concurrency(2)
            .shared_budget(shared.clone())
            .build()
            .unwrap(),
    );

    let doc = format!("{}{}", "a".repeat(10), "b".repeat(10));
    let err = assert_err!(s.scrape(&doc).await);
    assert_eq!(err.kind(), "backend_transport");

    let lifetime = shared.snapshot().await;
    assert!(lifetime.reserved() < 1e-12);
    assert!((lifetime.total_cost - 0.001).abs() < 1e-12);

    // The next extraction under the same cap is not refused.
    let r = assert_ok!(s.scrape(&"b".repeat(20)).await);
    assert_eq!(r.api_responses().len(), 2);
    assert!(shared.snapshot().await.reserved() < 1e-12);
    assert!((shared.snapshot().await.total_cost - 0.003).abs() < 1e-12);
}

// ── Retry ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_always_truncated_exhausts_retries() {
    init_tracing();
    let backend = Scripted::new(|_, _| {
        Ok(BackendReply {
            content: "[{\"plan\": \"Pro\"".into(),
            prompt_tokens: 100,
            completion_tokens: 50,
            finish: FinishReason::Length,
        })
    });
    let s = scraper(
        backend.clone(),
        config(cheap())
            .retry(RetryPolicy::new(2, Duration::ZERO))
            .build()
            .unwrap(),
    );

    let err = assert_err!(s.scrape("pricing page").await);
    match &err {
        ScrapeError::TruncatedOutput {
            attempts, response, ..
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(response.api_responses().len(), 3);
            assert!(response
                .api_responses()
                .iter()
                .all(|a| a.finish == FinishReason::Length));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_transport_failure_makes_n_plus_one_attempts_and_records_nothing() {
    let backend = Scripted::new(|_, _| Err(BackendError::Transport("503".into())));
    let s = scraper(
        backend.clone(),
        config(cheap())
            .retry(RetryPolicy::new(3, Duration::ZERO))
            .build()
            .unwrap(),
    );

    let err = assert_err!(s.scrape("page").await);
    match &err {
        ScrapeError::BackendTransport {
            attempts,
            detail,
            response,
            ..
        } => {
            assert_eq!(*attempts, 4);
            assert!(detail.contains("503"));
            assert!(response.api_responses().is_empty());
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(backend.calls(), 4);
    assert_eq!(err.spend(), 0.0);
}

#[tokio::test]
async fn test_malformed_reply_is_charged_then_retried() {
    let backend = Scripted::new(|n, _| {
        if n == 0 {
            reply("Sorry, here is a summary instead.", 100, 20)
        } else {
            reply("```json\n[\"ok\"]\n```", 100, 5)
        }
    });
    let s = scraper(
        backend.clone(),
        config(cheap())
            .retry(RetryPolicy::new(1, Duration::ZERO))
            .build()
            .unwrap(),
    );

    let r = assert_ok!(s.scrape("page").await);
    assert_eq!(backend.calls(), 2);
    assert_eq!(r.api_responses().len(), 2);
    assert_eq!(r.data(), &Data::List(vec![json!("ok")]));
    assert_eq!(r.response.total_completion_tokens, 25);
}

#[tokio::test]
async fn test_malformed_exhaustion() {
    let backend = Scripted::new(|_, _| reply("no json at all", 10, 10));
    let s = scraper(backend.clone(), config(cheap()).build().unwrap());

    let err = assert_err!(s.scrape("page").await);
    assert_eq!(err.kind(), "malformed_output");
    assert_eq!(err.response().unwrap().api_responses().len(), 1);
}

#[tokio::test]
async fn test_raw_text_when_json_not_required() {
    let backend = Scripted::new(|_, _| reply("Pro, Team", 10, 3));
    let s = scraper(backend, config(cheap()).require_json(false).build().unwrap());

    let r = assert_ok!(s.scrape("page").await);
    assert_eq!(r.data(), &Data::Text("Pro, Team".into()));
}

#[tokio::test]
async fn test_call_timeout_counts_as_transport_failure() {
    let backend = Scripted::with_delay(|_| Duration::from_secs(5), |_, _| reply("[]", 1, 1));
    let s = scraper(
        backend.clone(),
        config(cheap())
            .call_timeout(Some(Duration::from_millis(20)))
            .build()
            .unwrap(),
    );

    let err = assert_err!(s.scrape("page").await);
    assert_eq!(err.kind(), "backend_transport");
    assert!(err.to_string().contains("timed out"));
    assert!(err.response().unwrap().api_responses().is_empty());
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_during_retry_wait() {
    let backend = Scripted::new(|_, _| Err(BackendError::Transport("down".into())));
    let s = scraper(
        backend.clone(),
        config(cheap())
            .retry(RetryPolicy::new(5, Duration::from_secs(3600)))
            .build()
            .unwrap(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = assert_err!(s.scrape_request(ScrapeRequest::new("page"), &cancel).await);
    assert_eq!(err.kind(), "cancelled");
    assert_eq!(backend.calls(), 1);
}

// ── Postprocessing ───────────────────────────────────────────────────────────

struct Counting(Arc<AtomicUsize>);

impl Postprocessor for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn apply(
        &self,
        response: ScrapeResponse,
        view: &ScraperView<'_>,
    ) -> Result<ScrapeResponse, PostprocessError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        assert_eq!(view.instructions.as_str(), "Extract items");
        Ok(response)
    }
}

struct Reject;

impl Postprocessor for Reject {
    fn name(&self) -> &str {
        "reject"
    }

    fn apply(
        &self,
        _response: ScrapeResponse,
        _view: &ScraperView<'_>,
    ) -> Result<ScrapeResponse, PostprocessError> {
        Err(PostprocessError::new("reject", "not today"))
    }
}

#[tokio::test]
async fn test_chain_runs_once_after_merge() {
    let count = Arc::new(AtomicUsize::new(0));
    let backend = Scripted::new(|_, _| reply("[1]", 10, 1));
    let s = Scraper::builder(Schema::Text("items".into()), "Extract {schema}")
        .config(config(cheap()).auto_split_length(10).build().unwrap())
        .backend(backend.clone())
        .postprocessor(JsonPostprocessor)
        .postprocessor(Counting(Arc::clone(&count)))
        .build()
        .unwrap();

    let r = assert_ok!(s.scrape(&"z".repeat(35)).await);
    assert_eq!(backend.calls(), 4);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(r.data(), &Data::List(vec![json!(1); 4]));
}

#[tokio::test]
async fn test_postprocessing_error_carries_response() {
    let backend = Scripted::new(|_, _| reply("[1]", 10, 1));
    let s = Scraper::builder(Schema::Text("items".into()), "Extract {schema}")
        .config(config(cheap()).build().unwrap())
        .backend(backend)
        .postprocessor(Reject)
        .build()
        .unwrap();

    let err = assert_err!(s.scrape("page").await);
    match &err {
        ScrapeError::Postprocessing {
            step,
            detail,
            response,
        } => {
            assert_eq!(step, "reject");
            assert_eq!(detail, "not today");
            assert_eq!(response.api_responses().len(), 1);
            assert_eq!(response.data(), &Data::List(vec![json!(1)]));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

// ── Messages & determinism ───────────────────────────────────────────────────

#[tokio::test]
async fn test_message_layout_and_vision_attachment() {
    let backend = Scripted::new(|_, _| reply("[]", 10, 1));
    let s = scraper(
        backend.clone(),
        config(cheap())
            .extra_instruction("Prices are in USD.")
            .build()
            .unwrap(),
    );
    let image = ImageRef::url("https://cdn.example.org/shot.png");

    let r = assert_ok!(s.scrape_with_image("the page", image.clone()).await);
    assert_eq!(r.document.as_deref(), Some("the page"));

    let seen = backend.seen.lock().unwrap();
    let messages = &seen[0];
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[0].content, "Extract items");
    assert_eq!(messages[1].content, "Prices are in USD.");
    assert_eq!(messages[2].role, Role::User);
    assert_eq!(messages[2].content, "the page");
    assert_eq!(messages[2].images, vec![image]);
}

#[tokio::test]
async fn test_identical_inputs_give_identical_data() {
    let backend = Scripted::new(|_, chunk| reply(&format!(r#"[{{"len": {}}}]"#, chunk.len()), 10, 1));
    let s = scraper(backend, config(cheap()).auto_split_length(7).build().unwrap());

    let a = assert_ok!(s.scrape("abcdefghijklmnop").await);
    let b = assert_ok!(s.scrape("abcdefghijklmnop").await);
    assert_eq!(
        serde_json::to_string(a.data()).unwrap(),
        serde_json::to_string(b.data()).unwrap()
    );
    // Each extraction is accounted on its own.
    assert_eq!(a.api_responses().len(), 3);
    assert_eq!(b.api_responses().len(), 3);
}

#[tokio::test]
async fn test_response_serialises_accounting() {
    let backend = Scripted::new(|_, _| reply(r#"{"plan": "Pro"}"#, 1000, 500));
    let s = scraper(backend, config(cheap()).build().unwrap());

    let r = assert_ok!(
        s.scrape_request(
            ScrapeRequest::new("Pro plan").url("https://www.example.com/pricing"),
            &CancellationToken::new(),
        )
        .await
    );
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["url"], json!("https://www.example.com/pricing"));
    assert_eq!(v["data"], json!({"plan": "Pro"}));
    assert_eq!(v["total_prompt_tokens"], json!(1000));
    assert!((v["total_cost"].as_f64().unwrap() - 0.002).abs() < 1e-12);
    assert!(v.get("document").is_none());
}
