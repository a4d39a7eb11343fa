// ABOUTME: Concrete lock, set and document backends
// ABOUTME: In-memory implementations for tests and single-process use, SQLite cache for the CLI

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryDocumentStore, MemoryLocks, MemorySets, MemoryUpstream};
pub use sqlite::SqliteCache;
