//! Live, self-refreshing views over remote tables.

pub mod invalidation;
pub mod query;

pub use invalidation::InvalidationBus;
pub use query::{LiveQuery, QuerySpec, QueryState};
