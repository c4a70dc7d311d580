pub mod domain_schema;
pub mod kv;
pub mod migrate;

pub use kv::{InMemoryKvStore, KvStore, SqliteKvStore};
