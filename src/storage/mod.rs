//! Durable local storage: entity cache, mutation queue and legacy import.

pub mod database;
pub mod legacy;
pub mod local_store;
pub mod queue;

pub use database::Database;
pub use legacy::{LegacyMigrator, LegacyNamespace, MigrationOutcome, SqliteNamespace};
pub use local_store::LocalStore;
pub use queue::{MutationQueue, QueueStats};
