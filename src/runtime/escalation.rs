//! エスカレーション配送
//!
//! 記録済みの危機イベントをカウンセラー窓口（シンク）へ送るキュー。
//! 配送に失敗したイベントは保留され、`retry` で再送できる。
//! 配送の成否にかかわらずイベント自体は履歴に記録済みである。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::broadcaster::{MonitorBroadcaster, MonitorEvent};
use crate::crisis::event::{CrisisEvent, CrisisEventId};
use crate::error::EscalationError;

/// カウンセラー接続のお知らせ文言
pub const COUNSELOR_NOTICE: &str = "Connecting you to a human counselor within 60 seconds...";

/// エスカレーション先トレイト
#[async_trait]
pub trait EscalationSink: Send + Sync {
    /// 危機イベントを通知
    async fn notify(&self, event: &CrisisEvent) -> Result<(), EscalationError>;

    /// シンク名を取得
    fn name(&self) -> &'static str;
}

/// ログにお知らせを出力するだけのシンク
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl EscalationSink for LogSink {
    async fn notify(&self, event: &CrisisEvent) -> Result<(), EscalationError> {
        tracing::warn!(
            event_id = %event.id(),
            risk = %event.risk_level(),
            score = %event.emotion_score(),
            "📞 [ESCALATION] {}",
            COUNSELOR_NOTICE
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// 常に接続できないシンク（再試行経路の確認用）
#[derive(Debug, Clone, Default)]
pub struct UnreachableSink;

#[async_trait]
impl EscalationSink for UnreachableSink {
    async fn notify(&self, _event: &CrisisEvent) -> Result<(), EscalationError> {
        Err(EscalationError::Unreachable(
            "counselor backend is not configured".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

/// エスカレーション配送キュー
#[derive(Clone)]
pub struct EscalationDispatcher {
    sender: mpsc::UnboundedSender<CrisisEvent>,
    pending: Arc<Mutex<HashMap<CrisisEventId, CrisisEvent>>>,
}

impl EscalationDispatcher {
    /// 新しいキューを作成し、配送タスクを開始
    pub fn new(
        sink: Arc<dyn EscalationSink>,
        broadcaster: MonitorBroadcaster,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashMap::new()));

        let handle = tokio::spawn(Self::process_queue(
            receiver,
            sink,
            broadcaster,
            Arc::clone(&pending),
        ));

        (Self { sender, pending }, handle)
    }

    /// イベントを配送キューに追加
    pub fn dispatch(&self, event: CrisisEvent) -> Result<(), EscalationError> {
        self.sender
            .send(event)
            .map_err(|_| EscalationError::QueueClosed)
    }

    /// 配送に失敗したイベントを再送
    pub fn retry(&self, event_id: CrisisEventId) -> Result<(), EscalationError> {
        let event = self
            .pending
            .lock()
            .remove(&event_id)
            .ok_or(EscalationError::UnknownEvent(event_id))?;

        tracing::info!("🔁 [ESCALATION] Retrying delivery of {}", event_id);
        self.dispatch(event)
    }

    /// 再送待ちのイベントID
    pub fn pending_ids(&self) -> Vec<CrisisEventId> {
        self.pending.lock().keys().copied().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// キュー処理タスク
    async fn process_queue(
        mut receiver: mpsc::UnboundedReceiver<CrisisEvent>,
        sink: Arc<dyn EscalationSink>,
        broadcaster: MonitorBroadcaster,
        pending: Arc<Mutex<HashMap<CrisisEventId, CrisisEvent>>>,
    ) {
        tracing::debug!("📮 [ESCALATION] Dispatcher started (sink: {})", sink.name());

        while let Some(event) = receiver.recv().await {
            let event_id = event.id();
            match sink.notify(&event).await {
                Ok(()) => {
                    tracing::info!(
                        "✅ [ESCALATION] Delivered {} via {}",
                        event_id,
                        sink.name()
                    );
                    broadcaster.broadcast(MonitorEvent::EscalationDelivered {
                        event_id,
                        sink: sink.name(),
                    });
                }
                Err(e) => {
                    tracing::error!("❌ [ESCALATION] Delivery of {} failed: {}", event_id, e);
                    pending.lock().insert(event_id, event);
                    broadcaster.broadcast(MonitorEvent::EscalationFailed {
                        event_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!("📮 [ESCALATION] Dispatcher stopped");
    }
}
