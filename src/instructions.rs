//! Schemas, prompt templates and the message sequence sent to a model.
//!
//! The instruction text is rendered exactly once, when the scraper is built:
//! the caller's template has its `{schema}` placeholder replaced with the
//! schema, and the result is frozen in an [`Instructions`] value. Retries and
//! chunk calls all reuse the same rendered text, so the prompt cannot drift
//! within an extraction.
//!
//! Templates follow the brace convention of Python's `str.format`: `{{` and
//! `}}` produce literal braces. Any other `{...}` group is left as-is so JSON
//! examples inside a prompt survive without escaping.

use crate::error::ScrapeError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default template for the text-only variant.
pub const DEFAULT_TEXT_PROMPT: &str = r#"You are a data extraction engine. The user message contains the visible text of a web page.

Extract every item described by the following schema and return it as JSON:

{schema}

Rules:
- Output ONLY a JSON value matching the schema. No prose, no markdown fences.
- Copy values exactly as they appear on the page; do not invent values.
- Use null for a field the page does not state.
- When the page lists several items of the same kind, return a JSON array."#;

/// Default template for the vision-augmented variant.
pub const DEFAULT_VISION_PROMPT: &str = r#"You are a data extraction engine. The user message contains the visible text of a web page together with a full-page screenshot of the same page.

Use the screenshot to understand layout (which price belongs to which plan, which column a feature sits in) and the text to copy exact values.

Extract every item described by the following schema and return it as JSON:

{schema}

Rules:
- Output ONLY a JSON value matching the schema. No prose, no markdown fences.
- Copy values exactly as they appear on the page; do not invent values.
- Use null for a field the page does not state.
- When the page lists several items of the same kind, return a JSON array."#;

/// The caller-supplied description of the desired output shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schema {
    /// Free-form description, e.g. `"a list of plan names"`.
    Text(String),
    /// Field name → type/description, arbitrarily nested.
    Structured(Map<String, Value>),
    /// A sequence schema, usually one element describing each item.
    List(Vec<Value>),
}

impl TryFrom<Value> for Schema {
    type Error = ScrapeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Ok(Schema::Text(s)),
            Value::Object(m) if !m.is_empty() => Ok(Schema::Structured(m)),
            Value::Array(v) if !v.is_empty() => Ok(Schema::List(v)),
            Value::String(_) | Value::Object(_) | Value::Array(_) => Err(
                ScrapeError::InvalidConfig("schema must not be empty".into()),
            ),
            other => Err(ScrapeError::InvalidConfig(format!(
                "schema must be a string, object or array, got {other}"
            ))),
        }
    }
}

impl Schema {
    /// Load a JSON schema file verbatim.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScrapeError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ScrapeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            ScrapeError::InvalidConfig(format!("schema '{}' is not valid JSON: {e}", path.display()))
        })?;
        Self::try_from(value)
    }

    /// Text substituted for `{schema}` in a template.
    pub fn render(&self) -> String {
        match self {
            Schema::Text(s) => s.clone(),
            Schema::Structured(m) => {
                serde_json::to_string_pretty(m).unwrap_or_else(|_| format!("{m:?}"))
            }
            Schema::List(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| format!("{v:?}")),
        }
    }
}

/// Rendered, immutable instruction text.
#[derive(Debug, Clone)]
pub struct Instructions {
    rendered: Arc<str>,
}

impl Instructions {
    /// Render `template` with `schema` substituted for `{schema}`.
    pub fn render(template: &str, schema: &Schema) -> Self {
        if !template.contains("{schema}") {
            warn!("Instruction template has no {{schema}} placeholder; the schema will not be sent");
        }
        let schema_text = schema.render();
        let mut out = String::with_capacity(template.len() + schema_text.len());
        let mut rest = template;
        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if tail.starts_with("{{") {
                out.push('{');
                rest = &tail[2..];
            } else if tail.starts_with("}}") {
                out.push('}');
                rest = &tail[2..];
            } else if tail.starts_with("{schema}") {
                out.push_str(&schema_text);
                rest = &tail["{schema}".len()..];
            } else {
                out.push_str(&tail[..1]);
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        debug!("Rendered instructions: {} chars", out.len());
        Self {
            rendered: Arc::from(out),
        }
    }

    /// Read a template file and render it.
    pub fn from_file(path: impl AsRef<Path>, schema: &Schema) -> Result<Self, ScrapeError> {
        let path = path.as_ref();
        let template = std::fs::read_to_string(path).map_err(|e| ScrapeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::render(&template, schema))
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

/// Chat role of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// Opaque handle to a visual rendering of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageRef {
    /// Publicly reachable URL (e.g. an uploaded screenshot).
    Url(String),
    /// Base64 bytes embedded in the request.
    Inline { data: String, mime_type: String },
}

impl ImageRef {
    pub fn url(url: impl Into<String>) -> Self {
        ImageRef::Url(url.into())
    }

    /// Load a screenshot from disk as an inline image.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScrapeError> {
        let path = path.as_ref();
        let mime_type = image::ImageFormat::from_path(path)
            .map(|f| f.to_mime_type().to_string())
            .map_err(|e| {
                ScrapeError::InvalidConfig(format!(
                    "cannot infer image type of '{}': {e}",
                    path.display()
                ))
            })?;
        let bytes = std::fs::read(path).map_err(|e| ScrapeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let data = STANDARD.encode(&bytes);
        debug!("Loaded screenshot {} → {} bytes base64", path.display(), data.len());
        Ok(ImageRef::Inline { data, mime_type })
    }
}

/// One message of the composed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.images.push(image);
        self
    }
}

/// Build the message sequence for one call: the frozen instructions, then
/// each extra instruction in order, then the document (with the image when
/// present).
pub fn compose_messages(
    instructions: &Instructions,
    extra: &[String],
    document: &str,
    image: Option<&ImageRef>,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(extra.len() + 2);
    messages.push(Message::system(instructions.as_str()));
    messages.extend(extra.iter().map(Message::system));
    let user = Message::user(document);
    messages.push(match image {
        Some(img) => user.with_image(img.clone()),
        None => user,
    });
    messages
}
