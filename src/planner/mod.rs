//! Planning module for reconciliation.
//!
//! This module classifies the differences between two deployment sets.

mod diff;

pub use diff::{Change, Diff, DiffEngine, DiffKind, DiffResult};
