//! Batch storage: the sole source of truth for batch and item state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::debug;

use atelier_core::{BatchId, DomainError, ItemId, OrgId};
use atelier_gen::GenRequest;

use super::types::{Batch, BatchStatus, Item, ItemOutcome, ItemStatus};

/// Batch store abstraction.
///
/// All mutation of batch/item state goes through this trait, from the step
/// executor (claim/record/finalize) and the cancellation path. Reads are
/// cheap snapshots; nothing here blocks on external work.
pub trait BatchStore: Send + Sync {
    /// Persist a new batch with all items queued, in sequence order.
    ///
    /// An empty payload list is rejected: a batch with nothing to do has no
    /// meaningful terminal status.
    fn create(&self, org_id: OrgId, payloads: Vec<GenRequest>) -> Result<BatchId, StoreError>;

    /// Read-only snapshot of a batch and its items (sequence order).
    fn get(&self, batch_id: BatchId) -> Result<(Batch, Vec<Item>), StoreError>;

    /// Atomically claim the earliest queued item (queued → processing).
    ///
    /// Returns `None` when no work remains, when another caller holds the
    /// single in-flight slot, or when the batch is terminal. All of these
    /// are benign, non-error outcomes. The first successful claim moves the
    /// batch from pending to processing.
    fn claim_next_queued(&self, batch_id: BatchId) -> Result<Option<Item>, StoreError>;

    /// Atomically record an item outcome and recompute the owning batch's
    /// counters and status. Returns the updated batch.
    fn record_outcome(&self, item_id: ItemId, outcome: ItemOutcome) -> Result<Batch, StoreError>;

    /// Persist a computed terminal status. No-op when the batch is already
    /// terminal; rejects non-terminal statuses.
    fn finalize(&self, batch_id: BatchId, status: BatchStatus) -> Result<Batch, StoreError>;

    /// Mark a batch cancelled. Idempotent: cancelling a terminal batch
    /// (including an already-cancelled one) leaves it untouched.
    fn mark_cancelled(&self, batch_id: BatchId) -> Result<Batch, StoreError>;

    /// List batches belonging to an organization, oldest first.
    fn list_for_org(&self, org_id: OrgId) -> Result<Vec<Batch>, StoreError>;
}

/// Batch store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Infrastructure hiccup (network, connection pool). Callers retry with
    /// backoff; never fatal to the batch itself.
    #[error("transient store failure: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// In-memory batch store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    batches: RwLock<HashMap<BatchId, Batch>>,
    items: RwLock<HashMap<ItemId, Item>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn items_of(items: &HashMap<ItemId, Item>, batch_id: BatchId) -> Vec<Item> {
        let mut result: Vec<Item> = items
            .values()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect();
        result.sort_by_key(|i| i.seq);
        result
    }
}

impl BatchStore for InMemoryBatchStore {
    fn create(&self, org_id: OrgId, payloads: Vec<GenRequest>) -> Result<BatchId, StoreError> {
        if payloads.is_empty() {
            return Err(DomainError::validation("batch requires at least one item").into());
        }

        let mut batches = self.batches.write().unwrap();
        let mut items = self.items.write().unwrap();

        let batch = Batch::new(org_id, payloads.len() as u32);
        let batch_id = batch.id;
        for (seq, payload) in payloads.into_iter().enumerate() {
            let item = Item::new(batch_id, seq as u32, payload);
            items.insert(item.id, item);
        }
        batches.insert(batch_id, batch);

        debug!(%batch_id, %org_id, "created batch");
        Ok(batch_id)
    }

    fn get(&self, batch_id: BatchId) -> Result<(Batch, Vec<Item>), StoreError> {
        let batches = self.batches.read().unwrap();
        let items = self.items.read().unwrap();

        let batch = batches
            .get(&batch_id)
            .cloned()
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        Ok((batch, Self::items_of(&items, batch_id)))
    }

    fn claim_next_queued(&self, batch_id: BatchId) -> Result<Option<Item>, StoreError> {
        let mut batches = self.batches.write().unwrap();
        let mut items = self.items.write().unwrap();

        let batch = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        if batch.status.is_terminal() {
            return Ok(None);
        }

        let batch_items = Self::items_of(&items, batch_id);
        // Single-flight: at most one item per batch may be processing.
        if batch_items
            .iter()
            .any(|i| i.status == ItemStatus::Processing)
        {
            return Ok(None);
        }

        let Some(next) = batch_items.iter().find(|i| i.status == ItemStatus::Queued) else {
            return Ok(None);
        };

        let item = items
            .get_mut(&next.id)
            .ok_or(StoreError::ItemNotFound(next.id))?;
        item.mark_claimed()?;
        batch.mark_processing();

        Ok(Some(item.clone()))
    }

    fn record_outcome(&self, item_id: ItemId, outcome: ItemOutcome) -> Result<Batch, StoreError> {
        let mut batches = self.batches.write().unwrap();
        let mut items = self.items.write().unwrap();

        let batch_id = {
            let item = items
                .get_mut(&item_id)
                .ok_or(StoreError::ItemNotFound(item_id))?;
            item.record(outcome)?;
            item.batch_id
        };

        let batch = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        let batch_items = Self::items_of(&items, batch_id);
        batch.recompute(&batch_items);

        Ok(batch.clone())
    }

    fn finalize(&self, batch_id: BatchId, status: BatchStatus) -> Result<Batch, StoreError> {
        if !status.is_terminal() {
            return Err(
                DomainError::validation(format!("finalize requires a terminal status, got {status:?}"))
                    .into(),
            );
        }

        let mut batches = self.batches.write().unwrap();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        if batch.status.is_terminal() {
            return Ok(batch.clone());
        }

        batch.status = status;
        batch.updated_at = Utc::now();
        Ok(batch.clone())
    }

    fn mark_cancelled(&self, batch_id: BatchId) -> Result<Batch, StoreError> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.mark_cancelled();
        Ok(batch.clone())
    }

    fn list_for_org(&self, org_id: OrgId) -> Result<Vec<Batch>, StoreError> {
        let batches = self.batches.read().unwrap();
        let mut result: Vec<Batch> = batches
            .values()
            .filter(|b| b.org_id == org_id)
            .cloned()
            .collect();
        result.sort_by_key(|b| b.created_at);
        Ok(result)
    }
}

impl BatchStore for Arc<InMemoryBatchStore> {
    fn create(&self, org_id: OrgId, payloads: Vec<GenRequest>) -> Result<BatchId, StoreError> {
        (**self).create(org_id, payloads)
    }

    fn get(&self, batch_id: BatchId) -> Result<(Batch, Vec<Item>), StoreError> {
        (**self).get(batch_id)
    }

    fn claim_next_queued(&self, batch_id: BatchId) -> Result<Option<Item>, StoreError> {
        (**self).claim_next_queued(batch_id)
    }

    fn record_outcome(&self, item_id: ItemId, outcome: ItemOutcome) -> Result<Batch, StoreError> {
        (**self).record_outcome(item_id, outcome)
    }

    fn finalize(&self, batch_id: BatchId, status: BatchStatus) -> Result<Batch, StoreError> {
        (**self).finalize(batch_id, status)
    }

    fn mark_cancelled(&self, batch_id: BatchId) -> Result<Batch, StoreError> {
        (**self).mark_cancelled(batch_id)
    }

    fn list_for_org(&self, org_id: OrgId) -> Result<Vec<Batch>, StoreError> {
        (**self).list_for_org(org_id)
    }
}
