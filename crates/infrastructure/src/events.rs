use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use taskengine_core::events::{EventPublisher, TaskEngineEvent};
use taskengine_core::EngineResult;

/// 基于广播通道的事件发布器
///
/// 订阅方通过subscribe拿到接收端；没有订阅方时事件被丢弃，
/// 发布永远不会失败，事件流不参与引擎的正确性。
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<TaskEngineEvent>,
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEngineEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: TaskEngineEvent) -> EngineResult<()> {
        debug!("发布事件: {} 任务 {}", event.event_type(), event.task_id());
        // 没有接收方时send返回错误，事件直接丢弃
        let _ = self.sender.send(event);
        Ok(())
    }
}
