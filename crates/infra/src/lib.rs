//! Infrastructure layer: batch store, step execution, driver loop.

pub mod batch;
