//! Document splitting and chunk-payload merging.
//!
//! A document longer than the split threshold `L` is cut into
//! `ceil(chars / L)` ordered, non-overlapping chunks. Lengths are counted in
//! characters, never bytes, so a chunk boundary can't land inside a
//! multi-byte code point.
//!
//! Merging is strict: a [`MergePolicy`] states which payload shape it expects
//! and anything else is reported as ambiguous rather than silently coerced.

use crate::config::MergePolicy;
use crate::response::Data;
use serde_json::{Map, Value};

/// Split `document` into chunks of at most `max_chars` characters.
///
/// Returns the whole document as a single chunk when it fits.
pub fn split_document(document: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = document;
    while !rest.is_empty() {
        let cut = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(idx, _)| idx);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    if chunks.is_empty() {
        chunks.push(document);
    }
    chunks
}

/// Merge chunk payloads, in chunk order, under `policy`.
///
/// On failure returns a human-readable description of the conflict.
pub fn merge_payloads(payloads: Vec<Data>, policy: &MergePolicy) -> Result<Data, String> {
    if payloads.len() == 1 {
        return Ok(payloads.into_iter().next().unwrap_or_default());
    }
    match policy {
        MergePolicy::ListConcat => {
            let mut merged = Vec::new();
            for (i, payload) in payloads.into_iter().enumerate() {
                match payload {
                    Data::List(items) => merged.extend(items),
                    other => {
                        return Err(format!(
                            "chunk {i} produced a {} but list concatenation needs a list",
                            other.shape()
                        ))
                    }
                }
            }
            Ok(Data::List(merged))
        }
        MergePolicy::TextJoin(sep) => {
            let parts: Vec<String> = payloads.iter().map(render_text).collect();
            Ok(Data::Text(parts.join(sep)))
        }
        MergePolicy::ObjectUnion => {
            let mut merged = Map::new();
            for (i, payload) in payloads.into_iter().enumerate() {
                let Data::Structured(map) = payload else {
                    return Err(format!(
                        "chunk {i} produced a {} but object union needs a mapping",
                        payload.shape()
                    ));
                };
                for (key, value) in map {
                    match merged.get(&key) {
                        Some(existing) if *existing != value => {
                            return Err(format!(
                                "key '{key}' has conflicting values {existing} and {value} (chunk {i})"
                            ));
                        }
                        Some(_) => {}
                        None => {
                            merged.insert(key, value);
                        }
                    }
                }
            }
            Ok(Data::Structured(merged))
        }
    }
}

fn render_text(data: &Data) -> String {
    match data {
        Data::Text(s) => s.clone(),
        other => Value::to_string(&other.to_value()),
    }
}
