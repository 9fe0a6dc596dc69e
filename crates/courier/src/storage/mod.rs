//! Storage traits and implementations
//!
//! The trait-based design lets the sync engine run against SQLite in
//! production and an in-memory store in tests.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{AccountStore, ChannelStore, CursorStore, EntityStore, SyncStore};
