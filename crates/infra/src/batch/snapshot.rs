//! Pure read projection of batch progress.
//!
//! Snapshots never claim or execute work. The same shape is returned by
//! status reads and by every step call, so observers and drivers share one
//! view of progress.

use serde::{Deserialize, Serialize};

use atelier_core::{BatchId, ItemId};

use super::types::{Batch, BatchStatus, Item, ItemStatus};

/// Progress snapshot of a batch and its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    /// Share of items that reached a terminal status, in percent.
    pub percentage: f64,
    /// Most recently finished items, newest first.
    pub recent_items: Vec<RecentItem>,
    /// Every failed item with its error message, in sequence order.
    pub failed_details: Vec<FailedDetail>,
}

/// Summary line for one recently finished item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentItem {
    pub id: ItemId,
    pub label: String,
    pub status: ItemStatus,
}

/// Structured failure detail for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDetail {
    pub item_id: ItemId,
    pub error: String,
}

impl BatchSnapshot {
    /// Project a snapshot from a batch and its items.
    ///
    /// `recent_window` bounds the `recent_items` list.
    pub fn project(batch: &Batch, items: &[Item], recent_window: usize) -> Self {
        let terminal = batch.completed_items + batch.failed_items;
        let percentage = if batch.total_items == 0 {
            100.0
        } else {
            f64::from(terminal) / f64::from(batch.total_items) * 100.0
        };

        let mut finished: Vec<&Item> = items.iter().filter(|i| i.completed_at.is_some()).collect();
        // Newest first; sequence position breaks timestamp ties deterministically.
        finished.sort_by(|a, b| (b.completed_at, b.seq).cmp(&(a.completed_at, a.seq)));
        let recent_items = finished
            .iter()
            .take(recent_window)
            .map(|i| RecentItem {
                id: i.id,
                label: i.payload.label.clone(),
                status: i.status,
            })
            .collect();

        let failed_details = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .map(|i| FailedDetail {
                item_id: i.id,
                error: i.error.clone().unwrap_or_default(),
            })
            .collect();

        Self {
            batch_id: batch.id,
            status: batch.status,
            total_items: batch.total_items,
            completed_items: batch.completed_items,
            failed_items: batch.failed_items,
            percentage,
            recent_items,
            failed_details,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
