//! Domain entities shared across panels and the manager that keeps a panel's
//! selected entity in step with the rest of the application.

mod loader;
mod sync;
mod types;

pub use loader::{EntityLoader, InMemoryEntityLoader};
pub use sync::{EntitySyncManager, EntitySyncOptions, FetchOptions, SyncStatus};
pub use types::{Entity, EntityKind, EntityPatch, EntityRef};
