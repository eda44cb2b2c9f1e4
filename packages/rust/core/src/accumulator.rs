//! Weekly accumulation of Tier-2 survivors.
//!
//! Collect runs append into a per-week bucket keyed by day; a finalize run
//! loads the whole week and, once the report is rendered, clears it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, instrument};

use curator_shared::{Item, Result, WeekId};
use curator_storage::Storage;

use crate::report::RenderReceipt;

pub struct WeeklyAccumulator {
    storage: Arc<Storage>,
}

impl WeeklyAccumulator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Add `items` to the bucket for `day`. Re-appending the same identifiers
    /// for the same day is a no-op. Returns the number of new entries.
    #[instrument(skip_all, fields(week = %week, %day, items = items.len()))]
    pub async fn append(&self, week: &WeekId, day: NaiveDate, items: &[Item]) -> Result<usize> {
        let mut seen = HashSet::new();
        let distinct: Vec<Item> = items
            .iter()
            .filter(|item| seen.insert(item.id.clone()))
            .cloned()
            .collect();
        let inserted = self.storage.append_week_items(week, day, &distinct).await?;
        info!(inserted, "items accumulated");
        Ok(inserted)
    }

    /// Every item accumulated for the week, ordered by day. The same story
    /// collected on two days appears twice.
    pub async fn load(&self, week: &WeekId) -> Result<Vec<Item>> {
        Ok(self
            .storage
            .load_week_items(week)
            .await?
            .into_iter()
            .map(|entry| entry.item)
            .collect())
    }

    pub async fn day_counts(&self, week: &WeekId) -> Result<Vec<(NaiveDate, usize)>> {
        self.storage.week_day_counts(week).await
    }

    /// Clear the week. Requires the receipt of a successful render.
    #[instrument(skip_all, fields(week = %week, run_id = %receipt.run_id))]
    pub async fn finalize(&self, week: &WeekId, receipt: &RenderReceipt) -> Result<usize> {
        let removed = self.storage.clear_week(week).await?;
        info!(removed, report_sha256 = %receipt.sha256, "weekly bucket cleared");
        Ok(removed)
    }
}
