//! `atelier-gen`
//!
//! **Responsibility:** The opaque content-generation capability boundary.
//!
//! This crate is intentionally **not** part of the batch state machine:
//! - It must not depend on batch/item records or the store.
//! - It must not mutate batch state.
//! - It turns one request into one artifact reference (or an error), nothing more.
//!
//! The batch subsystem injects a [`Generator`] and treats it as a black box,
//! so tests can substitute a deterministic double without touching the
//! state machine.

pub mod artifact;
pub mod generator;
pub mod request;

pub use artifact::{ArtifactRef, GenError};
pub use generator::Generator;
pub use request::GenRequest;
