pub mod config;
pub mod error;
pub mod model;
pub mod reachability;
pub mod remote;
pub mod storage;
pub mod sync;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use model::{Entity, FieldPatch, MutationKind, NewMutation, QueueEntry, SyncReport};
pub use reachability::{ConnectivityEvent, LinkState, ReachabilityMonitor, ReachabilitySnapshot};
pub use remote::{HttpRemote, MemoryRemote, RemoteStore};
pub use storage::{Database, LegacyMigrator, LocalStore, MutationQueue, SqliteNamespace};
pub use sync::{EntityRepository, SaveOutcome, SyncManager, SyncReconciler};
