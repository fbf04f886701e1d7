use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{Task, TaskOutcome};
use crate::{EngineError, EngineResult};

/// 可插拔的任务运行器
///
/// 运行器通过返回TaskOutcome表达成功、稍后重试或失败，
/// 不使用异常控制流。运行器需要容忍偶发的重复执行。
#[async_trait]
pub trait Runner: Send + Sync {
    /// 运行器标识，任务的runner字段通过它解析
    fn name(&self) -> &str;

    async fn execute(&self, task: &Task) -> EngineResult<TaskOutcome>;
}

/// 运行器注册表
///
/// 启动时显式填充的查找表，未注册的运行器在派发时
/// 立刻以类型化错误失败，不做任何反射式解析。
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        let name = runner.name().to_string();
        tracing::info!("注册任务运行器: {}", name);
        self.runners.insert(name, runner);
    }

    pub fn get(&self, name: &str) -> EngineResult<Arc<dyn Runner>> {
        self.runners
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRunner {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }
}
