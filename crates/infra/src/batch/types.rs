//! Batch and item records and their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{BatchId, DomainError, DomainResult, ItemId, OrgId};
use atelier_gen::{ArtifactRef, GenRequest};

/// Batch lifecycle status.
///
/// `Completed`, `Failed`, and `Cancelled` are absorbing: once reached, no
/// operation moves a batch out of them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, no item claimed yet
    Pending,
    /// At least one item has been claimed
    Processing,
    /// All items terminal, at least one succeeded
    Completed,
    /// All items terminal, none succeeded
    Failed,
    /// Cancellation was requested before all items finished
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

/// Item lifecycle status.
///
/// Transitions are monotonic: queued → processing → {completed|failed},
/// never backwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// A batch of generation items tracked together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique batch ID
    pub id: BatchId,
    /// Owning organization
    pub org_id: OrgId,
    /// Current status
    pub status: BatchStatus,
    /// Number of items enqueued at creation (fixed for the batch lifetime)
    pub total_items: u32,
    /// Items that completed successfully
    pub completed_items: u32,
    /// Items that failed
    pub failed_items: u32,
    /// When the batch was created
    pub created_at: DateTime<Utc>,
    /// When the batch was last mutated
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// Create a new pending batch.
    pub fn new(org_id: OrgId, total_items: u32) -> Self {
        let now = Utc::now();
        Self {
            id: BatchId::new(),
            org_id,
            status: BatchStatus::Pending,
            total_items,
            completed_items: 0,
            failed_items: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute aggregate counters and status from the item set.
    ///
    /// Counters are always recounted from the items, so the
    /// `completed + failed ≤ total` invariant holds by construction. A
    /// terminal batch keeps its status (counters may still move when an
    /// in-flight item records its outcome after cancellation).
    pub fn recompute(&mut self, items: &[Item]) {
        self.completed_items = items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .count() as u32;
        self.failed_items = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count() as u32;
        self.updated_at = Utc::now();

        if self.status.is_terminal() {
            return;
        }

        if !items.is_empty() && items.iter().all(|i| i.status.is_terminal()) {
            self.status = self.final_status();
        }
    }

    /// The terminal status this batch settles on: cancelled if cancellation
    /// was requested, completed if at least one item succeeded, failed
    /// otherwise.
    pub fn final_status(&self) -> BatchStatus {
        if self.status == BatchStatus::Cancelled {
            BatchStatus::Cancelled
        } else if self.completed_items > 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        }
    }

    /// Mark the batch as having work in flight (first successful claim).
    pub fn mark_processing(&mut self) {
        if self.status == BatchStatus::Pending {
            self.status = BatchStatus::Processing;
            self.updated_at = Utc::now();
        }
    }

    /// Request cancellation. Returns `false` (and leaves the batch untouched)
    /// when the batch is already terminal.
    pub fn mark_cancelled(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = BatchStatus::Cancelled;
        self.updated_at = Utc::now();
        true
    }
}

/// One unit of generation work inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique item ID
    pub id: ItemId,
    /// Owning batch
    pub batch_id: BatchId,
    /// Position within the batch (items are claimed in this order)
    pub seq: u32,
    /// Current status
    pub status: ItemStatus,
    /// Opaque generation request
    pub payload: GenRequest,
    /// Artifact reference, set on success
    pub result: Option<ArtifactRef>,
    /// Error message, set on failure
    pub error: Option<String>,
    /// When the item was claimed for execution
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of executing one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed(ArtifactRef),
    Failed(String),
}

impl Item {
    /// Create a new queued item.
    pub fn new(batch_id: BatchId, seq: u32, payload: GenRequest) -> Self {
        Self {
            id: ItemId::new(),
            batch_id,
            seq,
            status: ItemStatus::Queued,
            payload,
            result: None,
            error: None,
            claimed_at: None,
            completed_at: None,
        }
    }

    /// Transition queued → processing.
    pub fn mark_claimed(&mut self) -> DomainResult<()> {
        if self.status != ItemStatus::Queued {
            return Err(DomainError::invariant(format!(
                "cannot claim item {} in status {:?}",
                self.id, self.status
            )));
        }
        self.status = ItemStatus::Processing;
        self.claimed_at = Some(Utc::now());
        Ok(())
    }

    /// Record the outcome of an execution. Requires the item to be processing;
    /// terminal items never regress or change their outcome.
    pub fn record(&mut self, outcome: ItemOutcome) -> DomainResult<()> {
        if self.status != ItemStatus::Processing {
            return Err(DomainError::invariant(format!(
                "cannot record outcome for item {} in status {:?}",
                self.id, self.status
            )));
        }
        match outcome {
            ItemOutcome::Completed(artifact) => {
                self.status = ItemStatus::Completed;
                self.result = Some(artifact);
            }
            ItemOutcome::Failed(message) => {
                self.status = ItemStatus::Failed;
                self.error = Some(message);
            }
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_item() -> Item {
        Item::new(BatchId::new(), 0, GenRequest::new("scene-1"))
    }

    #[test]
    fn item_transitions_are_monotonic() {
        let mut item = test_item();
        assert_eq!(item.status, ItemStatus::Queued);

        item.mark_claimed().unwrap();
        assert_eq!(item.status, ItemStatus::Processing);
        assert!(item.claimed_at.is_some());

        item.record(ItemOutcome::Completed(ArtifactRef::new("artifact://a")))
            .unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.completed_at.is_some());

        // Terminal items never regress or flip outcome.
        assert!(item.record(ItemOutcome::Failed("late".into())).is_err());
        assert!(item.mark_claimed().is_err());
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[test]
    fn queued_item_cannot_record_outcome() {
        let mut item = test_item();
        let err = item
            .record(ItemOutcome::Failed("no claim".into()))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn recompute_counts_and_finalizes() {
        let org = OrgId::new();
        let mut batch = Batch::new(org, 2);
        let mut a = Item::new(batch.id, 0, GenRequest::new("a"));
        let mut b = Item::new(batch.id, 1, GenRequest::new("b"));

        a.mark_claimed().unwrap();
        a.record(ItemOutcome::Completed(ArtifactRef::new("artifact://a")))
            .unwrap();
        batch.mark_processing();
        batch.recompute(&[a.clone(), b.clone()]);
        assert_eq!(batch.completed_items, 1);
        assert_eq!(batch.failed_items, 0);
        assert_eq!(batch.status, BatchStatus::Processing);

        b.mark_claimed().unwrap();
        b.record(ItemOutcome::Failed("boom".into())).unwrap();
        batch.recompute(&[a, b]);
        assert_eq!(batch.completed_items, 1);
        assert_eq!(batch.failed_items, 1);
        assert_eq!(batch.status, BatchStatus::Completed);
    }

    #[test]
    fn all_failures_finalize_as_failed() {
        let mut batch = Batch::new(OrgId::new(), 1);
        let mut a = Item::new(batch.id, 0, GenRequest::new("a"));
        a.mark_claimed().unwrap();
        a.record(ItemOutcome::Failed("boom".into())).unwrap();
        batch.mark_processing();
        batch.recompute(&[a]);
        assert_eq!(batch.status, BatchStatus::Failed);
    }

    #[test]
    fn cancelled_batch_keeps_status_but_counts_move() {
        let mut batch = Batch::new(OrgId::new(), 2);
        let mut a = Item::new(batch.id, 0, GenRequest::new("a"));
        a.mark_claimed().unwrap();
        batch.mark_processing();

        assert!(batch.mark_cancelled());
        // In-flight item finishes after cancellation and records its outcome.
        a.record(ItemOutcome::Completed(ArtifactRef::new("artifact://a")))
            .unwrap();
        let b = Item::new(batch.id, 1, GenRequest::new("b"));
        batch.recompute(&[a, b]);

        assert_eq!(batch.status, BatchStatus::Cancelled);
        assert_eq!(batch.completed_items, 1);
    }

    #[test]
    fn cancelling_a_terminal_batch_is_a_no_op() {
        let mut batch = Batch::new(OrgId::new(), 1);
        batch.status = BatchStatus::Completed;
        assert!(!batch.mark_cancelled());
        assert_eq!(batch.status, BatchStatus::Completed);
    }
}
