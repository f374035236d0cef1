//! Result and accounting types returned by an extraction.
//!
//! A [`Response`] is the unit of result: running spend and token totals, one
//! [`ApiResponse`] per backend reply, accumulated wall-clock API time, and the
//! extracted [`Data`]. [`ScrapeResponse`] wraps it with the context of a
//! single `scrape*` call (source URL, the caller's document handle and the
//! chunk threshold that was in effect).
//!
//! All of these types serialise to JSON so a run can be archived next to the
//! extracted data for auditing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Why the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the completion.
    #[default]
    Stop,
    /// Output hit the token limit; the payload is truncated.
    Length,
    /// Provider-side content filter stopped the completion.
    ContentFilter,
    /// Any other provider-specific reason.
    Other(String),
}

impl FinishReason {
    /// Map a provider's raw `finish_reason` string.
    pub fn from_provider(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            None | Some("stop") | Some("end_turn") | Some("stop_sequence") | Some("") => {
                FinishReason::Stop
            }
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }

    /// `true` when the output was cut short before completion.
    pub fn is_truncation(&self) -> bool {
        matches!(self, FinishReason::Length)
    }
}

/// One raw backend reply, recorded exactly as it was charged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Model identifier the call was issued against.
    pub model: String,
    /// Raw output text.
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Dollar cost computed from the pricing table.
    pub cost: f64,
    pub finish: FinishReason,
    /// Wall-clock duration of the backend call.
    pub duration_ms: u64,
    /// Index of the document chunk this call served (0 when unsplit).
    pub chunk: usize,
}

/// Extracted payload: text, a mapping, or a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Data {
    Text(String),
    Structured(Map<String, Value>),
    List(Vec<Value>),
}

impl Default for Data {
    fn default() -> Self {
        Data::Text(String::new())
    }
}

impl Data {
    /// Classify an arbitrary JSON value. Scalars become their JSON text.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Data::Structured(map),
            Value::Array(items) => Data::List(items),
            Value::String(s) => Data::Text(s),
            other => Data::Text(other.to_string()),
        }
    }

    /// Convert back into a JSON value.
    pub fn into_value(self) -> Value {
        match self {
            Data::Text(s) => Value::String(s),
            Data::Structured(map) => Value::Object(map),
            Data::List(items) => Value::Array(items),
        }
    }

    /// Borrowing counterpart of [`Data::into_value`].
    pub fn to_value(&self) -> Value {
        self.clone().into_value()
    }

    /// Short shape name used in logs and merge diagnostics.
    pub fn shape(&self) -> &'static str {
        match self {
            Data::Text(_) => "text",
            Data::Structured(_) => "mapping",
            Data::List(_) => "list",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Data::Text(s) => s.is_empty(),
            Data::Structured(m) => m.is_empty(),
            Data::List(v) => v.is_empty(),
        }
    }
}

/// Accumulated accounting and payload for one extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Every backend reply, in the order it was recorded.
    pub api_responses: Vec<ApiResponse>,
    pub total_cost: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    /// Wall-clock time spent inside backend calls.
    pub api_time_ms: u64,
    pub data: Data,
    /// Set when an accepted call pushed spend past the ceiling.
    #[serde(default)]
    pub over_budget: bool,
}

impl Response {
    /// Fold one charged reply into the totals.
    pub(crate) fn record(&mut self, reply: ApiResponse) {
        self.total_prompt_tokens += reply.prompt_tokens;
        self.total_completion_tokens += reply.completion_tokens;
        self.total_cost += reply.cost;
        self.api_time_ms += reply.duration_ms;
        self.api_responses.push(reply);
    }
}

/// [`Response`] plus the context of the `scrape*` call that produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeResponse {
    #[serde(flatten)]
    pub response: Response,
    /// Page the document came from, when known.
    pub url: Option<String>,
    /// The caller's document. Shared, never mutated by the scraper.
    #[serde(skip)]
    pub document: Option<Arc<str>>,
    /// Chunk threshold that was in effect for this extraction.
    pub auto_split_length: Option<usize>,
}

impl ScrapeResponse {
    pub fn data(&self) -> &Data {
        &self.response.data
    }

    pub fn total_cost(&self) -> f64 {
        self.response.total_cost
    }

    pub fn api_responses(&self) -> &[ApiResponse] {
        &self.response.api_responses
    }
}
