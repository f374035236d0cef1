//! Post-processing: deterministic checks and normalisation of extracted data.
//!
//! ## Why a chain?
//!
//! Models that are told to "output only JSON" still occasionally wrap the
//! payload in markdown fences, prefix it with a sentence of prose, or invent a
//! value that is nowhere on the page. Each of those is cheap to detect without
//! another model call, and each is independently testable, so every check is
//! its own [`Postprocessor`] and callers compose the ones they want into a
//! [`PostprocessorChain`].
//!
//! A step receives the finished [`ScrapeResponse`] by value and returns it
//! (possibly with `data` rewritten) or a [`PostprocessError`]. It only gets a
//! read-only [`ScraperView`]; accounting is already final when the chain runs.
//!
//! ## Order
//!
//! Steps run in registration order. Put [`JsonPostprocessor`] first so the
//! validators see structured data.

use crate::error::PostprocessError;
use crate::instructions::Schema;
use crate::response::{Data, ScrapeResponse};
use crate::scraper::ScraperView;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One step of the chain.
pub trait Postprocessor: Send + Sync {
    /// Step name used in error reports.
    fn name(&self) -> &str;

    fn apply(
        &self,
        response: ScrapeResponse,
        view: &ScraperView<'_>,
    ) -> Result<ScrapeResponse, PostprocessError>;
}

/// Ordered list of postprocessors. Empty chain is the identity.
#[derive(Clone, Default)]
pub struct PostprocessorChain {
    steps: Vec<Arc<dyn Postprocessor>>,
}

impl fmt::Debug for PostprocessorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.name()))
            .finish()
    }
}

impl PostprocessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: impl Postprocessor + 'static) {
        self.steps.push(Arc::new(step));
    }

    pub fn with(mut self, step: impl Postprocessor + 'static) -> Self {
        self.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, stopping at the first failure.
    pub fn apply(
        &self,
        mut response: ScrapeResponse,
        view: &ScraperView<'_>,
    ) -> Result<ScrapeResponse, PostprocessError> {
        for step in &self.steps {
            debug!("Postprocessor '{}'", step.name());
            response = step.apply(response, view)?;
        }
        Ok(response)
    }
}

// ── JSON salvage ─────────────────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)\n?\s*```").unwrap()
});

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

/// Find a JSON value in model output.
///
/// Tried in order: the whole text, the first fenced block, then the outermost
/// `[...]` or `{...}` span (whichever opens first).
pub fn extract_json(text: &str) -> Option<Value> {
    let cleaned = remove_invisible_chars(text);
    let t = cleaned.trim();
    if t.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(t) {
        return Some(v);
    }

    if let Some(caps) = RE_FENCED.captures(t) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            return Some(v);
        }
    }

    let mut spans = [('[', ']'), ('{', '}')]
        .into_iter()
        .filter_map(|(open, close)| {
            let i = t.find(open)?;
            let j = t.rfind(close)?;
            (i < j).then_some((i, j))
        })
        .collect::<Vec<_>>();
    spans.sort_by_key(|&(i, _)| i);
    spans
        .into_iter()
        .find_map(|(i, j)| serde_json::from_str::<Value>(&t[i..=j]).ok())
}

// ── JsonPostprocessor ────────────────────────────────────────────────────────

/// Turns a textual payload into structured data.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPostprocessor;

impl Postprocessor for JsonPostprocessor {
    fn name(&self) -> &str {
        "json"
    }

    fn apply(
        &self,
        mut response: ScrapeResponse,
        _view: &ScraperView<'_>,
    ) -> Result<ScrapeResponse, PostprocessError> {
        if let Data::Text(text) = &response.response.data {
            let value = extract_json(text).ok_or_else(|| {
                let preview: String = text.chars().take(80).collect();
                PostprocessError::new(self.name(), format!("no JSON value in output: {preview:?}"))
            })?;
            response.response.data = Data::from_value(value);
        }
        Ok(response)
    }
}

// ── SchemaValidator ──────────────────────────────────────────────────────────

/// Checks that the data has the shape the schema asks for.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    fn check_keys(&self, item: &Value, keys: &Map<String, Value>, at: &str) -> Result<(), PostprocessError> {
        let Value::Object(obj) = item else {
            return Err(PostprocessError::new(
                self.name(),
                format!("{at}: expected a mapping, got {}", json_kind(item)),
            ));
        };
        match keys.keys().find(|k| !obj.contains_key(*k)) {
            Some(missing) => Err(PostprocessError::new(
                self.name(),
                format!("{at}: missing field '{missing}'"),
            )),
            None => Ok(()),
        }
    }
}

impl Postprocessor for SchemaValidator {
    fn name(&self) -> &str {
        "schema"
    }

    fn apply(
        &self,
        response: ScrapeResponse,
        view: &ScraperView<'_>,
    ) -> Result<ScrapeResponse, PostprocessError> {
        match (view.schema, response.data()) {
            (Schema::Text(_), _) => {}
            (Schema::Structured(keys), Data::Structured(map)) => {
                self.check_keys(&Value::Object(map.clone()), keys, "data")?;
            }
            (Schema::Structured(keys), Data::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_keys(item, keys, &format!("item {i}"))?;
                }
            }
            (Schema::List(shape), Data::List(items)) => {
                if let Some(Value::Object(keys)) = shape.first() {
                    for (i, item) in items.iter().enumerate() {
                        self.check_keys(item, keys, &format!("item {i}"))?;
                    }
                }
            }
            (schema, data) => {
                let wanted = match schema {
                    Schema::List(_) => "a list",
                    _ => "a mapping or a list of mappings",
                };
                return Err(PostprocessError::new(
                    self.name(),
                    format!("expected {wanted}, got {}", data.shape()),
                ));
            }
        }
        Ok(response)
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

// ── HallucinationChecker ─────────────────────────────────────────────────────

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn normalise(s: &str) -> String {
    RE_WHITESPACE.replace_all(s.trim(), " ").to_lowercase()
}

/// Rejects string values that do not occur in the source document.
///
/// Comparison is case-insensitive with whitespace runs collapsed. Responses
/// without a document handle pass unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct HallucinationChecker;

impl Postprocessor for HallucinationChecker {
    fn name(&self) -> &str {
        "hallucination"
    }

    fn apply(
        &self,
        response: ScrapeResponse,
        _view: &ScraperView<'_>,
    ) -> Result<ScrapeResponse, PostprocessError> {
        let Some(document) = response.document.as_deref() else {
            return Ok(response);
        };
        let haystack = normalise(document);
        if matches!(response.data(), Data::Text(_)) {
            return Ok(response);
        }
        let value = response.data().to_value();
        let mut leaves = Vec::new();
        collect_strings(&value, &mut leaves);
        if let Some(bad) = leaves
            .iter()
            .map(|s| normalise(s))
            .find(|s| !s.is_empty() && !haystack.contains(s.as_str()))
        {
            return Err(PostprocessError::new(
                self.name(),
                format!("value {bad:?} does not appear in the source document"),
            ));
        }
        Ok(response)
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
