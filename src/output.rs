//! Persisting extracted data.

use crate::error::ScrapeError;
use crate::response::Data;
use crate::source::site_key;
use std::path::{Path, PathBuf};
use tracing::info;

/// Which extraction variant produced the data; part of the output file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeVariant {
    Text,
    Vision,
}

impl ScrapeVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeVariant::Text => "text_scraper",
            ScrapeVariant::Vision => "vision_scraper",
        }
    }
}

/// Output path for `url`: `<dir>/<host>_<variant>_response.json`.
pub fn output_path(dir: impl AsRef<Path>, url: &str, variant: ScrapeVariant) -> PathBuf {
    dir.as_ref()
        .join(format!("{}_{}_response.json", site_key(url), variant.as_str()))
}

/// Write `data` as pretty JSON and return the path written.
///
/// The file is written to a temporary sibling first and renamed into place,
/// so a reader never observes a half-written result.
pub async fn persist_data(
    data: &Data,
    url: &str,
    variant: ScrapeVariant,
    dir: impl AsRef<Path>,
) -> Result<PathBuf, ScrapeError> {
    let path = output_path(dir, url, variant);
    let io_err = |e: std::io::Error| ScrapeError::Io {
        path: path.clone(),
        source: e,
    };

    let json = serde_json::to_string_pretty(data)
        .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(io_err)?;
    tokio::fs::rename(&tmp_path, &path).await.map_err(io_err)?;

    info!("Data saved to {}", path.display());
    Ok(path)
}
