//! Recorded bar feed replayed one bar at a time.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::models::{PriceBar, RawBar};

/// A recorded OHLCV series with a cursor marking "now".
///
/// Only bars up to and including the cursor are visible to the exchange.
#[derive(Debug, Clone)]
pub struct ReplayFeed {
    symbol: String,
    timeframe: String,
    bars: Vec<PriceBar>,
    visible: usize,
}

impl ReplayFeed {
    /// Build a feed with the first bar visible.
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>, bars: Vec<PriceBar>) -> Result<Self> {
        if bars.is_empty() {
            bail!("Replay feed has no bars");
        }
        if let Some(pair) = bars.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
            bail!(
                "Replay feed timestamps must be strictly increasing ({} then {})",
                pair[0].timestamp,
                pair[1].timestamp
            );
        }

        Ok(Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            bars,
            visible: 1,
        })
    }

    /// Load a JSON array of ccxt-style `[ts, o, h, l, c, v]` rows or bar objects.
    pub fn load(path: &Path, symbol: &str, timeframe: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read feed {}", path.display()))?;
        Self::from_json(&content, symbol, timeframe)
            .with_context(|| format!("Invalid feed {}", path.display()))
    }

    pub fn from_json(json: &str, symbol: &str, timeframe: &str) -> Result<Self> {
        let raw: Vec<RawBar> = serde_json::from_str(json).context("Failed to parse bars")?;
        Self::new(symbol, timeframe, raw.into_iter().map(PriceBar::from).collect())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Number of bars currently visible.
    pub fn cursor(&self) -> usize {
        self.visible
    }

    /// Move the cursor, clamped to the feed.
    pub fn seek(&mut self, visible: usize) {
        self.visible = visible.clamp(1, self.bars.len());
    }

    /// Reveal the next bar. Returns `false` once the feed is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.visible += 1;
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.visible >= self.bars.len()
    }

    /// Latest visible bar.
    pub fn current(&self) -> &PriceBar {
        &self.bars[self.visible - 1]
    }

    /// Up to `limit` most recent visible bars, oldest first.
    pub fn window(&self, limit: usize) -> &[PriceBar] {
        let start = self.visible.saturating_sub(limit);
        &self.bars[start..self.visible]
    }

    /// Every bar in the recording, visible or not.
    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }
}
