//! Desired-state storage.
//!
//! Desired state is persisted as an append-only history per deployment:
//! writes diff against the stored state, append active rows for additions and
//! changes and append tombstones for removals.

mod memory;
mod sql;
mod store;

pub use memory::MemoryStateManager;
pub use sql::SqlStateManager;
pub use store::{
    HistoryRow, Lifecycle, StateManager, User, WritePlan, WriteSummary, plan_write, prepare_write,
};
