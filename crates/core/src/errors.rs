use thiserror::Error;

/// 任务引擎错误类型定义
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("任务已被节点 {node_id} 锁定: {id}")]
    TaskLocked { id: i64, node_id: i32 },

    #[error("任务已过期: {id}")]
    TaskExpired { id: i64 },

    #[error("未注册的运行器: {name}")]
    UnknownRunner { name: String },

    #[error("无效的任务定义: {0}")]
    InvalidTask(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    Execution(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl EngineError {
    /// 判断错误是否为瞬时错误，瞬时错误可以在下次轮询时重试
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Database(_))
    }
}

/// 统一的Result类型
pub type EngineResult<T> = std::result::Result<T, EngineError>;
