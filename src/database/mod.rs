pub mod memory_presence_store;
pub mod presence_store;
pub mod rest_presence_store;
pub mod sqlite_presence_store;

pub use memory_presence_store::{MemoryPresenceStore, StoreOp};
pub use presence_store::{PresenceDelta, PresenceStore, StoreEvent, StoreEventStream};
pub use rest_presence_store::RestPresenceStore;
pub use sqlite_presence_store::SqlitePresenceStore;
