//! Candle feeder backed by JSON history files.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::Feeder;
use crate::models::Candle;

/// Serves candles loaded up front, grouped by pair and sorted by time.
///
/// Subscriptions replay the stored candles, optionally paced so paper runs
/// can watch the tickers fire.
pub struct HistoryFeeder {
    candles: BTreeMap<String, Vec<Candle>>,
    pace: Option<Duration>,
}

impl HistoryFeeder {
    pub fn new(candles: Vec<Candle>) -> Self {
        let mut by_pair: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            by_pair.entry(candle.pair.clone()).or_default().push(candle);
        }
        for series in by_pair.values_mut() {
            series.sort_by_key(|c| c.time);
        }
        Self {
            candles: by_pair,
            pace: None,
        }
    }

    /// Load a JSON array of candles.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read candle file {}", path.display()))?;
        let candles: Vec<Candle> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse candle file {}", path.display()))?;

        info!(path = %path.display(), candles = candles.len(), "Loaded candle history");
        Ok(Self::new(candles))
    }

    /// Delay between candles on subscriptions.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn pairs(&self) -> Vec<String> {
        self.candles.keys().cloned().collect()
    }

    fn series(&self, pair: &str, timeframe: &str) -> impl Iterator<Item = &Candle> {
        let timeframe = timeframe.to_string();
        self.candles
            .get(pair)
            .into_iter()
            .flatten()
            .filter(move |c| c.timeframe == timeframe)
    }
}

#[async_trait]
impl Feeder for HistoryFeeder {
    async fn candles_by_limit(&self, pair: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        let series: Vec<Candle> = self.series(pair, timeframe).cloned().collect();
        let skip = series.len().saturating_sub(limit);
        Ok(series.into_iter().skip(skip).collect())
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        Ok(self
            .series(pair, timeframe)
            .filter(|c| c.time >= start && c.time <= end)
            .cloned()
            .collect())
    }

    async fn candles_subscription(&self, pair: &str, timeframe: &str) -> Result<mpsc::Receiver<Candle>> {
        let series: Vec<Candle> = self.series(pair, timeframe).cloned().collect();
        let (tx, rx) = mpsc::channel(256);
        let pace = self.pace;
        let pair = pair.to_string();

        tokio::spawn(async move {
            for candle in series {
                if tx.send(candle).await.is_err() {
                    debug!(pair = %pair, "Candle subscriber dropped");
                    return;
                }
                if let Some(pace) = pace {
                    tokio::time::sleep(pace).await;
                }
            }
            debug!(pair = %pair, "Candle history exhausted");
        });

        Ok(rx)
    }
}
