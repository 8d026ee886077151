pub mod error;
pub mod memory;
pub mod mock;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{open_store, CheckpointStore};
