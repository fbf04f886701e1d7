//! 内置任务运行器
//!
//! 运行器通过注册表按名称解析；这里提供两个常用实现，
//! 业务方按同样的方式注册自己的运行器。

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use taskengine_core::models::{Task, TaskOutcome};
use taskengine_core::traits::Runner;
use taskengine_core::{EngineError, EngineResult};

/// Shell任务参数
#[derive(Debug, Deserialize)]
struct ShellTaskParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    working_dir: Option<String>,
}

/// Shell命令运行器
///
/// payload格式: {"command": "...", "args": [...], "working_dir": "..."}
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for ShellRunner {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, task: &Task) -> EngineResult<TaskOutcome> {
        let params: ShellTaskParams = serde_json::from_value(task.payload.clone())
            .map_err(|e| EngineError::InvalidTask(format!("解析Shell任务参数失败: {e}")))?;

        info!(
            "执行Shell任务 {}: {} {:?}",
            task.id, params.command, params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::Execution(format!("启动Shell命令失败: {e}")))?;

        if output.status.success() {
            Ok(TaskOutcome::Success)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Shell任务 {} 退出码 {:?}: {}",
                task.id,
                output.status.code(),
                stderr.trim()
            );
            Ok(TaskOutcome::Failed {
                message: format!(
                    "命令退出码 {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                ),
            })
        }
    }
}

/// HTTP任务参数
#[derive(Debug, Deserialize)]
struct HttpTaskParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP请求运行器
///
/// payload格式: {"url": "...", "method": "POST", "body": {...}}
/// 429和5xx响应视为瞬时失败交给重试策略。
pub struct HttpRunner {
    client: reqwest::Client,
}

impl Default for HttpRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRunner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Runner for HttpRunner {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, task: &Task) -> EngineResult<TaskOutcome> {
        let params: HttpTaskParams = serde_json::from_value(task.payload.clone())
            .map_err(|e| EngineError::InvalidTask(format!("解析HTTP任务参数失败: {e}")))?;

        let method: reqwest::Method = params
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| EngineError::InvalidTask(format!("无效的HTTP方法: {}", params.method)))?;

        info!("执行HTTP任务 {}: {} {}", task.id, method, params.url);

        let mut request = self.client.request(method, &params.url);
        if let Some(body) = &params.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // 网络层错误视为瞬时失败
                return Ok(TaskOutcome::RetryLater {
                    reason: format!("HTTP请求失败: {e}"),
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            Ok(TaskOutcome::Success)
        } else if status.as_u16() == 429 || status.is_server_error() {
            Ok(TaskOutcome::RetryLater {
                reason: format!("HTTP状态码 {status}"),
            })
        } else {
            Ok(TaskOutcome::Failed {
                message: format!("HTTP状态码 {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn shell_task(payload: serde_json::Value) -> Task {
        Task {
            id: 1,
            node_id: None,
            node_group: None,
            execution_date: Utc::now(),
            expiration_date: None,
            runner: "shell".to_string(),
            payload,
            retry_count: 0,
            lock_owner_node_id: Some(0),
            locked_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let runner = ShellRunner::new();
        let task = shell_task(serde_json::json!({"command": "true"}));
        assert_eq!(runner.execute(&task).await.unwrap(), TaskOutcome::Success);
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let runner = ShellRunner::new();
        let task = shell_task(serde_json::json!({"command": "false"}));
        assert!(matches!(
            runner.execute(&task).await.unwrap(),
            TaskOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_shell_runner_rejects_bad_payload() {
        let runner = ShellRunner::new();
        let task = shell_task(serde_json::json!({"not_command": 1}));
        assert!(matches!(
            runner.execute(&task).await,
            Err(EngineError::InvalidTask(_))
        ));
    }
}
