//! Document sources: fetching pages, reducing HTML, publishing screenshots.
//!
//! These collaborators sit outside the extraction core. The core never
//! fetches or renders anything itself; it receives a text document (and
//! optionally an [`ImageRef`](crate::ImageRef)) prepared here or by the
//! caller.
//!
//! ## Why reduce HTML before extraction?
//!
//! Prompt tokens are the dominant cost of a scrape. Scripts, styles and
//! navigation links carry no extractable data but can easily make up most of
//! a page's bytes, so they are dropped before the document ever reaches the
//! token estimator.

use ::scraper::{ElementRef, Html};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Elements removed together with their content.
pub const DEFAULT_UNWANTED_TAGS: &[&str] = &["script", "style", "a", "img"];

/// Elements whose text is kept when extracting.
pub const DEFAULT_EXTRACT_TAGS: &[&str] = &["p", "li", "div"];

/// Failure of a source collaborator.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    #[error("Fetching '{url}' timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("Upload of '{object}' failed: {reason}")]
    Upload { object: String, reason: String },

    #[error("Environment variable {0} is not set.\nIt is required to upload screenshots.")]
    MissingEnv(&'static str),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── URL handling ─────────────────────────────────────────────────────────────

/// Normalise a user-typed site into a fetchable URL.
///
/// Adds `https://` when no scheme is given, adds `www.` to a bare
/// `domain.tld` host, and appends `path_suffix` (e.g. `/pricing`) unless the
/// URL already ends with it.
pub fn normalize_site_url(site: &str, path_suffix: Option<&str>) -> String {
    let site = site.trim().trim_end_matches('/');
    let (scheme, rest) = match site.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest),
        None => ("https".to_string(), site),
    };
    let (host, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let bare_host = host.split(':').next().unwrap_or(host);
    let is_ip = bare_host.chars().all(|c| c.is_ascii_digit() || c == '.');
    let host = if bare_host.matches('.').count() == 1 && !is_ip {
        format!("www.{host}")
    } else {
        host.to_string()
    };

    let mut url = format!("{scheme}://{host}{path}");
    if let Some(suffix) = path_suffix.map(|s| s.trim_end_matches('/')) {
        if !suffix.is_empty() && !url.ends_with(suffix) {
            if !suffix.starts_with('/') {
                url.push('/');
            }
            url.push_str(suffix);
        }
    }
    url
}

/// Filesystem-safe key for a URL: its host, with a port separator replaced.
pub fn site_key(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    host.replace(':', "_")
}

// ── Fetching ─────────────────────────────────────────────────────────────────

/// Download a page and return its body as text.
pub async fn fetch_document(url: &str, timeout_secs: u64) -> Result<String, SourceError> {
    info!("Fetching page: {}", url);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("web2json/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SourceError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            SourceError::Timeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            SourceError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(SourceError::Fetch {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let body = response.text().await.map_err(|e| SourceError::Fetch {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    debug!("Fetched {} bytes from {}", body.len(), url);
    Ok(body)
}

// ── HTML reduction ───────────────────────────────────────────────────────────

/// Reduce raw HTML to the visible text worth sending to a model.
///
/// 1. Parse the page and skip every `unwanted_tags` element with its subtree
///    (comments never carry text).
/// 2. When `tags_to_extract` is non-empty, keep only the text of the
///    outermost matching elements, in document order; an element inside an
///    already collected one is not repeated. Falls back to the whole page
///    when none of them occur.
/// 3. Collapse all whitespace into single spaces. Entities are decoded by
///    the parser.
pub fn reduce_html(raw: &str, unwanted_tags: &[&str], tags_to_extract: &[&str]) -> String {
    let document = Html::parse_document(raw);
    let root = document.root_element();

    let mut parts = Vec::new();
    if !tags_to_extract.is_empty() {
        collect_extracted(root, unwanted_tags, tags_to_extract, &mut parts);
    }
    if parts.is_empty() {
        parts.push(visible_text(root, unwanted_tags));
    }
    parts.retain(|p| !p.is_empty());

    let text = parts.join(" ");
    debug!("Reduced HTML from {} to {} chars", raw.len(), text.len());
    text
}

fn has_tag(element: &ElementRef<'_>, tags: &[&str]) -> bool {
    let name = element.value().name();
    tags.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Walk in document order, collecting each outermost `extract` element.
fn collect_extracted(
    element: ElementRef<'_>,
    unwanted: &[&str],
    extract: &[&str],
    parts: &mut Vec<String>,
) {
    for child in element.children() {
        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };
        if has_tag(&child, unwanted) {
            continue;
        }
        if has_tag(&child, extract) {
            parts.push(visible_text(child, unwanted));
        } else {
            collect_extracted(child, unwanted, extract, parts);
        }
    }
}

/// Whitespace-normalised text of `element`, minus unwanted subtrees.
fn visible_text(element: ElementRef<'_>, unwanted: &[&str]) -> String {
    let mut pieces = Vec::new();
    push_text(element, unwanted, &mut pieces);
    pieces
        .iter()
        .flat_map(|p| p.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

fn push_text<'a>(element: ElementRef<'a>, unwanted: &[&str], pieces: &mut Vec<&'a str>) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            pieces.push(text);
        } else if let Some(child) = ElementRef::wrap(child) {
            if !has_tag(&child, unwanted) {
                push_text(child, unwanted, pieces);
            }
        }
    }
}

// ── Screenshot upload ────────────────────────────────────────────────────────

/// S3-compatible bucket (DigitalOcean Spaces by default) for public uploads.
#[cfg(feature = "upload")]
#[derive(Clone)]
pub struct SpacesConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

#[cfg(feature = "upload")]
impl std::fmt::Debug for SpacesConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpacesConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &"<redacted>")
            .finish()
    }
}

#[cfg(feature = "upload")]
impl SpacesConfig {
    /// Read `DO_SPACES_ACCESS_KEY`, `DO_SPACES_SECRET_KEY`, `DO_ENDPOINT_URL`
    /// and `DO_SPACES_BUCKET` (plus optional `DO_SPACES_REGION`).
    pub fn from_env() -> Result<Self, SourceError> {
        fn var(key: &'static str) -> Result<String, SourceError> {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or(SourceError::MissingEnv(key))
        }
        Ok(Self {
            access_key: var("DO_SPACES_ACCESS_KEY")?,
            secret_key: var("DO_SPACES_SECRET_KEY")?,
            endpoint: var("DO_ENDPOINT_URL")?.trim_end_matches('/').to_string(),
            bucket: var("DO_SPACES_BUCKET")?,
            region: std::env::var("DO_SPACES_REGION").unwrap_or_else(|_| "us-east-1".into()),
        })
    }

    /// Public URL an object ends up at.
    pub fn public_url(&self, object: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, object)
    }

    /// Upload `path` as `object` with a public-read ACL and return its URL.
    pub async fn upload(&self, path: &std::path::Path, object: &str) -> Result<String, SourceError> {
        use aws_sdk_s3::config::{Credentials, Region};
        use aws_sdk_s3::primitives::ByteStream;
        use aws_sdk_s3::types::ObjectCannedAcl;

        let bytes = tokio::fs::read(path).await.map_err(|e| SourceError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let content_type = image::ImageFormat::from_path(path)
            .map(|f| f.to_mime_type())
            .unwrap_or("application/octet-stream");

        let credentials =
            Credentials::new(&self.access_key, &self.secret_key, None, None, "web2json");
        let config = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(self.region.clone()))
            .endpoint_url(&self.endpoint)
            .force_path_style(true)
            .behavior_version_latest()
            .build();
        let client = aws_sdk_s3::Client::from_conf(config);

        info!("Uploading {} → {}/{}", path.display(), self.bucket, object);
        client
            .put_object()
            .bucket(&self.bucket)
            .key(object)
            .acl(ObjectCannedAcl::PublicRead)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| SourceError::Upload {
                object: object.to_string(),
                reason: e.to_string(),
            })?;

        Ok(self.public_url(object))
    }
}

/// Upload a screenshot to the bucket configured in the environment.
#[cfg(feature = "upload")]
pub async fn upload_public(path: &std::path::Path, object: &str) -> Result<String, SourceError> {
    SpacesConfig::from_env()?.upload(path, object).await
}

// ── Tests ────────────────────────────────────────────────────────────────────
