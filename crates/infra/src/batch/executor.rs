//! Step executor: advances a batch by at most one item per call.
//!
//! There is no notion of "currently running" between calls; every call reads
//! the store, does at most one unit of generation work, and writes the
//! outcome back. Any process holding an executor may call [`StepExecutor::step`]
//! at any time — a driver loop, a scheduled reaper picking up orphaned
//! batches, or a late duplicate caller — and none of them can corrupt state.

use std::time::Duration;

use tracing::{debug, info, warn};

use atelier_core::BatchId;
use atelier_gen::{GenRequest, Generator};

use super::snapshot::BatchSnapshot;
use super::store::{BatchStore, StoreError};
use super::types::{ItemOutcome, ItemStatus};

/// Step executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on one generation call. A timeout fails the item, not the
    /// batch; the external call is never forcibly interrupted before this.
    pub gen_timeout: Duration,
    /// How many recently finished items a snapshot carries.
    pub recent_window: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            gen_timeout: Duration::from_secs(30),
            recent_window: 5,
        }
    }
}

impl ExecutorConfig {
    pub fn with_gen_timeout(mut self, timeout: Duration) -> Self {
        self.gen_timeout = timeout;
        self
    }

    pub fn with_recent_window(mut self, window: usize) -> Self {
        self.recent_window = window;
        self
    }
}

/// Stateless step executor over a store and an injected generator.
pub struct StepExecutor<S: BatchStore, G: Generator> {
    store: S,
    generator: G,
    config: ExecutorConfig,
}

impl<S: BatchStore, G: Generator> StepExecutor<S, G> {
    pub fn new(store: S, generator: G) -> Self {
        Self::with_config(store, generator, ExecutorConfig::default())
    }

    pub fn with_config(store: S, generator: G, config: ExecutorConfig) -> Self {
        Self {
            store,
            generator,
            config,
        }
    }

    /// Side-effect-free progress read.
    pub fn status(&self, batch_id: BatchId) -> Result<BatchSnapshot, StoreError> {
        let (batch, items) = self.store.get(batch_id)?;
        Ok(BatchSnapshot::project(&batch, &items, self.config.recent_window))
    }

    /// Advance the batch by at most one item and return a progress snapshot.
    ///
    /// Safe to call concurrently, repeatedly, and after the batch is
    /// terminal: a terminal batch is returned unchanged, and a claim lost to
    /// a concurrent caller just re-observes status.
    pub async fn step(&self, batch_id: BatchId) -> Result<BatchSnapshot, StoreError> {
        let (batch, items) = self.store.get(batch_id)?;
        if batch.status.is_terminal() {
            debug!(%batch_id, status = ?batch.status, "step on terminal batch is a no-op");
            return Ok(BatchSnapshot::project(&batch, &items, self.config.recent_window));
        }

        match self.store.claim_next_queued(batch_id)? {
            Some(item) => {
                info!(%batch_id, item_id = %item.id, seq = item.seq, label = %item.payload.label, "claimed item");
                let outcome = self.generate(&item.payload).await;
                match &outcome {
                    ItemOutcome::Completed(artifact) => {
                        info!(%batch_id, item_id = %item.id, uri = %artifact.uri, "item completed")
                    }
                    ItemOutcome::Failed(error) => {
                        warn!(%batch_id, item_id = %item.id, %error, "item failed")
                    }
                }
                self.store.record_outcome(item.id, outcome)?;
            }
            None => self.drain(batch_id)?,
        }

        self.status(batch_id)
    }

    /// Request cancellation. Idempotent; an item mid-execution in a
    /// concurrent step finishes and records its own outcome.
    pub fn cancel(&self, batch_id: BatchId) -> Result<BatchSnapshot, StoreError> {
        let batch = self.store.mark_cancelled(batch_id)?;
        info!(%batch_id, status = ?batch.status, "cancellation requested");
        self.status(batch_id)
    }

    /// Re-enqueue this batch's failed items as a fresh batch.
    ///
    /// A retry is always a new item — failed items are never mutated, which
    /// keeps "at most one execution per item" simple and avoids looping on a
    /// systematically broken payload. Returns `None` when nothing failed.
    pub fn retry_failed(&self, batch_id: BatchId) -> Result<Option<BatchId>, StoreError> {
        let (batch, items) = self.store.get(batch_id)?;
        let payloads: Vec<_> = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .map(|i| i.payload.clone())
            .collect();
        if payloads.is_empty() {
            return Ok(None);
        }

        let retry_count = payloads.len();
        let new_batch_id = self.store.create(batch.org_id, payloads)?;
        info!(%batch_id, %new_batch_id, retry_count, "re-enqueued failed items as a new batch");
        Ok(Some(new_batch_id))
    }

    /// Execute one payload under the bounded timeout.
    async fn generate(&self, payload: &GenRequest) -> ItemOutcome {
        match tokio::time::timeout(self.config.gen_timeout, self.generator.execute(payload)).await {
            Ok(Ok(artifact)) => ItemOutcome::Completed(artifact),
            Ok(Err(err)) => ItemOutcome::Failed(err.to_string()),
            Err(_) => ItemOutcome::Failed(format!(
                "generation timed out after {}s",
                self.config.gen_timeout.as_secs()
            )),
        }
    }

    /// Nothing was claimable. If every item is terminal, settle the batch on
    /// its final status; otherwise a concurrent caller holds the in-flight
    /// slot and there is nothing to do.
    fn drain(&self, batch_id: BatchId) -> Result<(), StoreError> {
        let (batch, items) = self.store.get(batch_id)?;
        if items.iter().all(|i| i.status.is_terminal()) {
            let status = batch.final_status();
            self.store.finalize(batch_id, status)?;
            info!(%batch_id, ?status, completed = batch.completed_items, failed = batch.failed_items, "batch finalized");
        } else {
            debug!(%batch_id, "no claimable item, work still in flight elsewhere");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;

    use atelier_core::OrgId;
    use atelier_gen::{ArtifactRef, GenError, GenRequest};

    use crate::batch::store::InMemoryBatchStore;
    use crate::batch::types::BatchStatus;

    /// Deterministic generator double: fails the configured labels, succeeds
    /// on everything else.
    struct ScriptedGenerator {
        fail_labels: HashSet<String>,
        delay: Duration,
    }

    impl ScriptedGenerator {
        fn ok() -> Self {
            Self::failing_on([])
        }

        fn failing_on<const N: usize>(labels: [&str; N]) -> Self {
            Self {
                fail_labels: labels.iter().map(|s| s.to_string()).collect(),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn execute(&self, request: &GenRequest) -> Result<ArtifactRef, GenError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_labels.contains(&request.label) {
                return Err(GenError::failed(format!("cannot render {}", request.label)));
            }
            Ok(ArtifactRef::new(format!("artifact://{}", request.label)))
        }
    }

    fn payloads(n: usize) -> Vec<GenRequest> {
        (0..n).map(|i| GenRequest::new(format!("item-{i}"))).collect()
    }

    #[tokio::test]
    async fn step_processes_one_item_per_call() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(2)).unwrap();
        let executor = StepExecutor::new(store, ScriptedGenerator::ok());

        let snap = executor.step(batch_id).await.unwrap();
        assert_eq!(snap.completed_items, 1);
        assert_eq!(snap.status, BatchStatus::Processing);

        let snap = executor.step(batch_id).await.unwrap();
        assert_eq!(snap.completed_items, 2);
        assert_eq!(snap.status, BatchStatus::Completed);
        assert_eq!(snap.percentage, 100.0);
    }

    #[tokio::test]
    async fn failed_items_are_recorded_and_do_not_halt_the_batch() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(3)).unwrap();
        let executor =
            StepExecutor::new(store, ScriptedGenerator::failing_on(["item-1"]));

        let mut snap = executor.status(batch_id).unwrap();
        while !snap.is_terminal() {
            snap = executor.step(batch_id).await.unwrap();
        }

        assert_eq!(snap.status, BatchStatus::Completed);
        assert_eq!(snap.completed_items, 2);
        assert_eq!(snap.failed_items, 1);
        assert_eq!(snap.failed_details.len(), 1);
        assert_eq!(snap.failed_details[0].error, "generation failed: cannot render item-1");
    }

    #[tokio::test]
    async fn all_failures_settle_as_failed() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(2)).unwrap();
        let executor = StepExecutor::new(
            store,
            ScriptedGenerator::failing_on(["item-0", "item-1"]),
        );

        let mut snap = executor.status(batch_id).unwrap();
        while !snap.is_terminal() {
            snap = executor.step(batch_id).await.unwrap();
        }
        assert_eq!(snap.status, BatchStatus::Failed);
        assert_eq!(snap.failed_items, 2);
    }

    #[tokio::test]
    async fn step_on_terminal_batch_is_inert_and_stable() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(1)).unwrap();
        let executor = StepExecutor::new(store.clone(), ScriptedGenerator::ok());

        let terminal = executor.step(batch_id).await.unwrap();
        assert!(terminal.is_terminal());
        let state_before = store.get(batch_id).unwrap();

        for _ in 0..3 {
            let again = executor.step(batch_id).await.unwrap();
            assert_eq!(again, terminal);
        }
        assert_eq!(store.get(batch_id).unwrap(), state_before);
    }

    #[tokio::test]
    async fn generation_timeout_fails_the_item() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(1)).unwrap();
        let executor = StepExecutor::with_config(
            store,
            ScriptedGenerator::ok().with_delay(Duration::from_secs(5)),
            ExecutorConfig::default().with_gen_timeout(Duration::from_millis(20)),
        );

        let snap = executor.step(batch_id).await.unwrap();
        assert_eq!(snap.failed_items, 1);
        assert!(snap.failed_details[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_stops_claiming_but_not_finished_work() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(3)).unwrap();
        let executor = StepExecutor::new(store, ScriptedGenerator::ok());

        let snap = executor.step(batch_id).await.unwrap();
        assert_eq!(snap.completed_items, 1);

        let snap = executor.cancel(batch_id).unwrap();
        assert_eq!(snap.status, BatchStatus::Cancelled);

        // Later steps are no-ops; queued items stay queued.
        let snap = executor.step(batch_id).await.unwrap();
        assert_eq!(snap.status, BatchStatus::Cancelled);
        assert_eq!(snap.completed_items, 1);
        assert_eq!(snap.total_items, 3);

        // Cancel is idempotent, even on the now-terminal batch.
        let again = executor.cancel(batch_id).unwrap();
        assert_eq!(again, snap);
    }

    #[tokio::test]
    async fn retry_failed_creates_a_new_batch() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(2)).unwrap();
        let executor = StepExecutor::new(
            store.clone(),
            ScriptedGenerator::failing_on(["item-1"]),
        );

        let mut snap = executor.status(batch_id).unwrap();
        while !snap.is_terminal() {
            snap = executor.step(batch_id).await.unwrap();
        }

        let retry_id = executor.retry_failed(batch_id).unwrap().unwrap();
        assert_ne!(retry_id, batch_id);

        let (retry_batch, retry_items) = store.get(retry_id).unwrap();
        assert_eq!(retry_batch.status, BatchStatus::Pending);
        assert_eq!(retry_items.len(), 1);
        assert_eq!(retry_items[0].payload.label, "item-1");

        // The original batch is untouched.
        let original = executor.status(batch_id).unwrap();
        assert_eq!(original, snap);
    }

    #[tokio::test]
    async fn retry_failed_with_no_failures_is_none() {
        let store = InMemoryBatchStore::arc();
        let batch_id = store.create(OrgId::new(), payloads(1)).unwrap();
        let executor = StepExecutor::new(store, ScriptedGenerator::ok());

        executor.step(batch_id).await.unwrap();
        assert!(executor.retry_failed(batch_id).unwrap().is_none());
    }
}
