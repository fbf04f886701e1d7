pub mod database;
pub mod events;
pub mod memory;

pub use database::postgres::{PostgresClusterRepository, PostgresTaskRepository};
pub use database::sqlite::{SqliteClusterRepository, SqliteTaskRepository};
pub use events::BroadcastEventPublisher;
pub use memory::{MemoryClusterRepository, MemoryTaskRepository};
