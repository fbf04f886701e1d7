pub mod engine;
pub mod provider;
pub mod retry;
pub mod runners;
pub mod service;
pub mod strategy;
pub mod unlocker;

pub use engine::{EngineContext, EngineRunningState, EngineState, TaskEngine};
pub use provider::{DefaultTaskProvider, EngineParameters, TaskProvider};
pub use retry::RetryPolicy;
pub use runners::{HttpRunner, ShellRunner};
pub use service::{TaskService, TaskServiceBuilder};
pub use strategy::{DefaultExecutionStrategy, ExecutionStrategy};
pub use unlocker::StaleNodeUnlocker;
