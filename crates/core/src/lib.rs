pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::{AppConfig, RuntimeSettings};
pub use errors::{EngineError, EngineResult};
pub use events::{EventPublisher, TaskEngineEvent};
pub use models::{
    AbortedTask, ClaimRequest, ClusterNodeInfo, NewTask, Task, TaskDisposition, TaskOutcome,
};
pub use traits::{ClusterRepository, Runner, RunnerRegistry, TaskRepository};
