//! File-backed guider positions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::GuiderSource;
use crate::models::GuiderPosition;

/// Reads the followed account's positions from a JSON file on every call,
/// so an external process can keep the file current.
pub struct FileGuiderSource {
    path: PathBuf,
}

impl FileGuiderSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl GuiderSource for FileGuiderSource {
    async fn positions(&self) -> Result<Vec<GuiderPosition>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read guider file {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse guider file {}", self.path.display()))
    }
}
