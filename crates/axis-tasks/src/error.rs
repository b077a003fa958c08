//! Task error types

use thiserror::Error;

/// A task unit's completion was dropped without being signalled.
///
/// Chain error types convert from this so an abandoned unit fails the chain
/// instead of stalling it forever.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Task unit '{0}' was dropped before completing")]
pub struct UnitAbandoned(pub String);
