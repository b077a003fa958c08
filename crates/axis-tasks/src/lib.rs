//! Axis Task Coordination
//!
//! Building blocks for the fulfillment pipeline:
//! - `Guarded<T>`: one lock per component, closure-scoped access
//! - `TaskChain`: runs deferred units strictly in order, fail-fast
//! - `SyncCounter`: enter/leave/wait group for ordering callback-driven steps

mod chain;
mod counter;
mod error;
mod guarded;

pub use chain::{ChainResult, TaskChain, TaskCompletion, TaskUnit};
pub use counter::SyncCounter;
pub use error::UnitAbandoned;
pub use guarded::Guarded;
