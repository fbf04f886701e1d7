pub mod repository;
pub mod runner;

pub use repository::{ClusterRepository, TaskRepository};
pub use runner::{Runner, RunnerRegistry};
