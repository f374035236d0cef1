//! CLI binary for edgequake-scrape.
//!
//! A thin shim over the library crate: fetch and reduce a page, map CLI flags
//! to `ScraperConfig`, run one extraction and persist the data.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_scrape::source::{
    fetch_document, normalize_site_url, reduce_html, site_key, upload_public,
    DEFAULT_EXTRACT_TAGS, DEFAULT_UNWANTED_TAGS,
};
use edgequake_scrape::{
    persist_data, CancellationToken, Escalation, HallucinationChecker, ImageRef, JsonPostprocessor,
    ProviderBackend, RetryPolicy, Schema, ScrapeError, ScrapeRequest, ScrapeVariant, Scraper,
    ScraperConfig, SchemaValidator,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract pricing plans from a site's /pricing page
  web2json example.com --path-suffix /pricing \
      --schema schemas/pricing.json --prompt prompts/pricing.txt

  # Vision variant with a local screenshot uploaded to Spaces
  web2json example.com --path-suffix /pricing --vision \
      --image shots/example.png --upload \
      --schema schemas/pricing.json --prompt prompts/pricing.txt

  # Use a saved page, split long text, cap spend at 5 cents
  web2json https://www.example.com --html-file page.html \
      --split-length 8000 --max-cost 0.05 --schema s.json --prompt p.txt

  # Escalate to a larger model only when the page does not fit
  web2json example.com --model gpt-4o-mini --model gpt-4.1 --escalate \
      --schema s.json --prompt p.txt

OUTPUT:
  Data is written to <output-dir>/<host>_<text|vision>_scraper_response.json
  and printed to stdout. Progress and diagnostics go to stderr.

EXIT STATUS:
  0  extraction succeeded
  2  extraction failed (budget, retries exhausted, postprocessing, …);
     the diagnostic names the error kind and the spend already incurred
  1  any other failure (bad flags, fetch error, unreadable or invalid
     schema/prompt files, empty page)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  DO_SPACES_ACCESS_KEY    Spaces access key (--upload)
  DO_SPACES_SECRET_KEY    Spaces secret key (--upload)
  DO_ENDPOINT_URL         Spaces endpoint, e.g. https://nyc3.digitaloceanspaces.com
  DO_SPACES_BUCKET        Spaces bucket for screenshots
"#;

/// Extract schema-shaped JSON from a web page using LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "web2json",
    version,
    about = "Extract schema-shaped JSON from web pages using LLMs",
    long_about = "Fetch a web page, reduce it to its visible text and ask an LLM to extract the \
data described by a JSON schema. Spend is capped by --max-cost and every call is accounted \
for, even when the extraction fails.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Site or page URL (scheme and www. are added when missing).
    url: String,

    /// JSON file describing the data to extract.
    #[arg(long, env = "WEB2JSON_SCHEMA")]
    schema: PathBuf,

    /// Instruction template file; `{schema}` is replaced by the schema.
    #[arg(long, env = "WEB2JSON_PROMPT")]
    prompt: PathBuf,

    /// Additional instruction sent after the template (repeatable).
    #[arg(long = "instruction")]
    instructions: Vec<String>,

    /// Attach a screenshot of the page (vision variant).
    #[arg(long)]
    vision: bool,

    /// Screenshot for --vision: a local image path or a public URL.
    #[arg(long, env = "WEB2JSON_IMAGE")]
    image: Option<String>,

    /// Upload a local --image to Spaces and send its public URL.
    #[arg(long)]
    upload: bool,

    /// LLM model ID, cheapest first (repeatable). Default: gpt-3.5-turbo.
    #[arg(long = "model", env = "EDGEQUAKE_MODEL", value_delimiter = ',')]
    models: Vec<String>,

    /// Move to the next --model when the page does not fit the current one.
    #[arg(long)]
    escalate: bool,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "EDGEQUAKE_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// Dollar ceiling for this extraction.
    #[arg(long, env = "WEB2JSON_MAX_COST", default_value_t = 1.0)]
    max_cost: f64,

    /// Retries per LLM call.
    #[arg(long, env = "WEB2JSON_MAX_RETRIES", default_value_t = 1)]
    max_retries: u32,

    /// Seconds to wait before each retry.
    #[arg(long, env = "WEB2JSON_RETRY_WAIT", default_value_t = 30)]
    retry_wait: u64,

    /// Split pages longer than this many characters into chunks.
    #[arg(long, env = "WEB2JSON_SPLIT_LENGTH")]
    split_length: Option<usize>,

    /// Path appended to the site URL, e.g. /pricing.
    #[arg(long, env = "WEB2JSON_PATH_SUFFIX")]
    path_suffix: Option<String>,

    /// Read the page from this HTML file instead of fetching it.
    #[arg(long)]
    html_file: Option<PathBuf>,

    /// Directory for the persisted JSON.
    #[arg(long, env = "WEB2JSON_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Check the result has every schema field.
    #[arg(long)]
    validate: bool,

    /// Reject string values that do not appear on the page.
    #[arg(long)]
    check_hallucinations: bool,

    /// HTTP fetch timeout in seconds.
    #[arg(long, env = "WEB2JSON_FETCH_TIMEOUT", default_value_t = 60)]
    fetch_timeout: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "WEB2JSON_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "WEB2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "WEB2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner covers the quiet-but-interactive case; library INFO logs
    // would only fight with it.
    let show_progress = !cli.quiet && !cli.verbose;
    let filter = if cli.verbose {
        "debug"
    } else if show_progress || cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match run(&cli, show_progress).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<ScrapeError>() {
            Some(scrape) if scrape.started() => {
                eprintln!("{} {}", red("✘"), bold(&format!("Extraction failed [{}]", scrape.kind())));
                eprintln!("   {e:#}");
                if let Some(partial) = scrape.response() {
                    eprintln!(
                        "   spent {} over {} call(s)",
                        bold(&format!("${:.4}", partial.total_cost())),
                        partial.api_responses().len()
                    );
                }
                std::process::exit(2);
            }
            _ => Err(e),
        },
    }
}

async fn run(cli: &Cli, show_progress: bool) -> Result<()> {
    let url = normalize_site_url(&cli.url, cli.path_suffix.as_deref());

    // ── Inputs ───────────────────────────────────────────────────────────
    let schema = Schema::from_file(&cli.schema)?;
    let template = tokio::fs::read_to_string(&cli.prompt)
        .await
        .with_context(|| format!("Failed to read prompt template from {:?}", cli.prompt))?;

    let html = match cli.html_file {
        Some(ref path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read HTML from {path:?}"))?,
        None => fetch_document(&url, cli.fetch_timeout)
            .await
            .context("Failed to fetch page")?,
    };
    let document = reduce_html(&html, DEFAULT_UNWANTED_TAGS, DEFAULT_EXTRACT_TAGS);

    let image = if cli.vision {
        Some(resolve_image(cli, &url).await?)
    } else {
        None
    };
    let variant = if image.is_some() {
        ScrapeVariant::Vision
    } else {
        ScrapeVariant::Text
    };

    // ── Scraper ──────────────────────────────────────────────────────────
    let config = build_config(cli)?;
    let backend = ProviderBackend::resolve(cli.provider.as_deref(), &config.models)?;

    let mut builder = Scraper::builder(schema, template)
        .config(config)
        .backend(Arc::new(backend))
        .postprocessor(JsonPostprocessor);
    if cli.validate {
        builder = builder.postprocessor(SchemaValidator);
    }
    if cli.check_hallucinations {
        builder = builder.postprocessor(HallucinationChecker);
    }
    let scraper = builder.build()?;

    let mut request = ScrapeRequest::new(document).url(url.clone());
    if let Some(image) = image {
        request = request.image(image);
    }

    // Ctrl-C stops retry waits and pending chunks; spend so far is reported.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let spinner = show_progress.then(|| spinner(&url));
    let result = scraper.scrape_request(request, &cancel).await;
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
    let response = result?;

    // ── Output ───────────────────────────────────────────────────────────
    let path = persist_data(response.data(), &url, variant, &cli.output_dir).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(response.data()).context("Failed to serialise data")?
    );

    if !cli.quiet {
        eprintln!(
            "{}  {} call(s)  ${:.4}{}  →  {}",
            green("✔"),
            response.api_responses().len(),
            response.total_cost(),
            if response.response.over_budget {
                red("  (over budget)")
            } else {
                String::new()
            },
            bold(&path.display().to_string()),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out  ·  {}ms in API calls",
            dim(&response.response.total_prompt_tokens.to_string()),
            dim(&response.response.total_completion_tokens.to_string()),
            response.response.api_time_ms,
        );
    }
    Ok(())
}

/// Map CLI args to `ScraperConfig`.
fn build_config(cli: &Cli) -> Result<ScraperConfig> {
    let mut builder = ScraperConfig::builder()
        .models(cli.models.iter().cloned())
        .max_cost(cli.max_cost)
        .retry(RetryPolicy::new(
            cli.max_retries,
            Duration::from_secs(cli.retry_wait),
        ))
        .call_timeout(Some(Duration::from_secs(cli.api_timeout)));

    for text in &cli.instructions {
        builder = builder.extra_instruction(text.clone());
    }
    if let Some(len) = cli.split_length {
        builder = builder.auto_split_length(len);
    }
    if cli.escalate {
        builder = builder.escalation(Escalation::OnInputTooLarge);
    }
    Ok(builder.build()?)
}

/// Turn `--image` into an [`ImageRef`], uploading it first with `--upload`.
async fn resolve_image(cli: &Cli, url: &str) -> Result<ImageRef> {
    let Some(ref image) = cli.image else {
        bail!("--vision needs a screenshot: pass --image <path|url>");
    };
    if image.starts_with("http://") || image.starts_with("https://") {
        return Ok(ImageRef::url(image.clone()));
    }

    let path = Path::new(image);
    if cli.upload {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("png");
        let object = format!("{}_{}.{ext}", site_key(url), ScrapeVariant::Vision.as_str());
        let public = upload_public(path, &object)
            .await
            .context("Failed to upload screenshot")?;
        return Ok(ImageRef::url(public));
    }
    Ok(ImageRef::from_file(path)?)
}

fn spinner(url: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
    );
    bar.set_prefix("Extracting");
    bar.set_message(url.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}
