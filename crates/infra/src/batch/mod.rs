//! Step-driven batch generation subsystem.
//!
//! ## Design
//!
//! - No persistent worker is assumed: all progress happens inside short,
//!   externally-triggered step calls (a driver, or a scheduled reaper)
//! - The store is the sole source of truth; nothing is "running" between calls
//! - Claiming an item is an atomic queued → processing transition, so
//!   concurrent or duplicate callers never double-process work
//! - Item failures are isolated: a failed item is recorded and the batch
//!   moves on; a retry is a new item, never a mutation of a failed one
//! - Cancellation is cooperative: in-flight work finishes and records itself
//!
//! ## Components
//!
//! - `Batch`/`Item`: records and their state machines
//! - `BatchStore`: persistence boundary (in-memory or durable)
//! - `StepExecutor`: advances a batch by at most one item per call
//! - `BatchSnapshot`: pure read projection for status reporting
//! - `StepDriver`: loop that steps a batch to a terminal state with pacing,
//!   backoff, and a single-use liveness token

pub mod driver;
pub mod executor;
pub mod snapshot;
pub mod store;
pub mod types;

pub use driver::{DriverConfig, DriverError, DriverOutcome, LivenessToken, RetryPolicy, StepDriver};
pub use executor::{ExecutorConfig, StepExecutor};
pub use snapshot::{BatchSnapshot, FailedDetail, RecentItem};
pub use store::{BatchStore, InMemoryBatchStore, StoreError};
pub use types::{Batch, BatchStatus, Item, ItemOutcome, ItemStatus};
