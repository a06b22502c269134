//! Override Reindex Planner (C7)
//!
//! Reads a pending domain-scoped override window, slices it into
//! fixed-day sub-windows, dispatches each to a bounded worker pool, and
//! archives the override only if every sub-window succeeded (spec.md
//! §4.7). Workers are fully independent: no cross-worker shared mutable
//! state, and upsert ordering across sub-windows is unspecified (spec.md
//! §4.7, "Concurrency contract").

use crate::gateway::{GatewayError, StoreGateway};
use crate::hooks::HookRegistry;
use crate::index::IndexClient;
use crate::normalize::normalize;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

pub struct ReindexConfig {
    pub domain: String,
    pub get_all_procedure: String,
    pub collection_url: String,
    pub get_override_procedure: String,
    pub clean_override_procedure: String,
    pub source_ts_field: String,
    pub target_ts_field: String,
    pub step_days: i64,
    pub concurrency: usize,
}

pub struct ReindexPlanner {
    config: ReindexConfig,
    gateway: Arc<dyn StoreGateway>,
    index: Arc<dyn IndexClient>,
    hooks: Arc<HookRegistry>,
}

/// `[sub_start, sub_end]`, a fixed-day slice of an override window
/// (spec.md §3, "Sub-window").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Slice `[source, target]` into `STEP_DAYS`-wide sub-windows, preserving
/// the source's off-by-one behaviour (spec.md §9, Open Question O1): the
/// loop condition is checked *before* advancing, so the final sub-window
/// may overshoot `target`, and `source == target` still emits exactly one
/// sub-window of width `step_days` (spec.md §8, "Boundary behaviours").
pub fn slice_sub_windows(source: DateTime<Utc>, target: DateTime<Utc>, step_days: i64) -> Vec<SubWindow> {
    let mut windows = Vec::new();
    let mut cursor = source;
    loop {
        let end = cursor + ChronoDuration::days(step_days);
        windows.push(SubWindow { start: cursor, end });
        if end > target {
            break;
        }
        cursor = end;
    }
    windows
}

impl ReindexPlanner {
    pub fn new(
        config: ReindexConfig,
        gateway: Arc<dyn StoreGateway>,
        index: Arc<dyn IndexClient>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            config,
            gateway,
            index,
            hooks,
        }
    }

    /// Entry point: returns `Ok(true)` if an override was found and fully
    /// processed (and archived), `Ok(false)` if there was no override
    /// (caller falls through to a single unwindowed `get_all()`), and
    /// `Err` if the override lookup itself failed.
    pub async fn run(&self) -> Result<bool, GatewayError> {
        let Some((source, target)) = self.fetch_override().await? else {
            return Ok(false);
        };

        tracing::info!(
            domain = %self.config.domain,
            %source,
            %target,
            "index override identified"
        );

        let windows = slice_sub_windows(source, target, self.config.step_days);

        let results = stream::iter(windows.into_iter().map(|w| self.process_window(w)))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut all_ok = true;
        for result in &results {
            if let Err(e) = result {
                tracing::error!(error = %e, "sub-window worker failed");
                all_ok = false;
            }
        }

        if !all_ok {
            tracing::warn!(domain = %self.config.domain, "override not archived: at least one sub-window failed");
            return Ok(true);
        }

        self.gateway
            .call_void(
                &self.config.clean_override_procedure,
                vec![serde_json::Value::String(self.config.domain.clone())],
            )
            .await?;
        tracing::info!(domain = %self.config.domain, "override archived");
        Ok(true)
    }

    async fn fetch_override(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, GatewayError> {
        let batch = self
            .gateway
            .call(
                &self.config.get_override_procedure,
                vec![serde_json::Value::String(self.config.domain.clone())],
            )
            .await?;

        // "At most one active window per domain is assumed; if multiple
        // exist, only the first ... is honoured" (spec.md §3).
        let Some(row) = batch.rows.first() else {
            return Ok(None);
        };

        let source_idx = batch
            .columns
            .iter()
            .position(|c| c == &self.config.source_ts_field)
            .unwrap_or(0);
        let target_idx = batch
            .columns
            .iter()
            .position(|c| c == &self.config.target_ts_field)
            .unwrap_or(1);

        let source = match row.get(source_idx) {
            Some(crate::normalize::RawCell::Timestamp(ts)) => *ts,
            _ => return Ok(None),
        };
        let target = match row.get(target_idx) {
            Some(crate::normalize::RawCell::Timestamp(ts)) => *ts,
            _ => return Ok(None),
        };

        Ok(Some((source, target)))
    }

    /// Worker contract: fetch -> normalise -> hook -> upsert, for a single
    /// sub-window, fully independent of any other worker (spec.md §4.7
    /// step 3). An empty sub-window is a non-error.
    async fn process_window(&self, window: SubWindow) -> anyhow::Result<()> {
        tracing::debug!(start = %window.start, end = %window.end, "begin sub-window");
        let raw = self
            .gateway
            .call_get_all(&self.config.get_all_procedure, Some((window.start, window.end)))
            .await?;
        let mut batch = normalize(&raw);
        if batch.is_empty() {
            tracing::debug!(start = %window.start, end = %window.end, "sub-window empty, skipping upsert");
            return Ok(());
        }
        self.hooks.apply_hook(&self.config.domain, &mut batch)?;
        let documents = batch.documents();
        self.index.upsert(&self.config.collection_url, documents).await?;
        tracing::debug!(start = %window.start, end = %window.end, "end sub-window");
        Ok(())
    }

    /// The unwindowed fallback full refresh used when no override is
    /// pending (spec.md §4.7 step 1, §4.8 "Mode Entry").
    pub async fn run_unwindowed_full(&self) -> anyhow::Result<()> {
        let raw = self
            .gateway
            .call_get_all(&self.config.get_all_procedure, None)
            .await?;
        let mut batch = normalize(&raw);
        self.hooks.apply_hook(&self.config.domain, &mut batch)?;
        let documents = batch.documents();
        self.index.upsert(&self.config.collection_url, documents).await?;
        Ok(())
    }
}
