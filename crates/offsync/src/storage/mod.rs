pub mod cache;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use cache::CacheStore;
pub use memory::MemoryKv;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteKv;
pub use traits::KvStore;
