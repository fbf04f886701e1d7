pub mod sqlite_cluster_repository;
pub mod sqlite_task_repository;

pub use sqlite_cluster_repository::SqliteClusterRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
