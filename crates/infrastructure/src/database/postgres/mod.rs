pub mod postgres_cluster_repository;
pub mod postgres_task_repository;

pub use postgres_cluster_repository::PostgresClusterRepository;
pub use postgres_task_repository::PostgresTaskRepository;
