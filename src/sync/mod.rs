//! Reconciliation and the optimistic entity API
//!
//! - [`SyncReconciler`] drains the mutation queue and refreshes the cache
//! - [`EntityRepository`] applies writes locally first, then remotely or via the queue
//! - [`SyncManager`] runs a pass whenever connectivity is restored

pub mod manager;
pub mod reconciler;
pub mod repository;

pub use manager::{SyncCommand, SyncManager};
pub use reconciler::{dedup, SyncReconciler};
pub use repository::{EntityRepository, SaveOutcome};
