//! モニターイベントのブロードキャスト
//!
//! 描画側は状態をポーリングせず、このチャネルを購読して変化を受け取る。

use tokio::sync::broadcast;

use crate::crisis::event::CrisisEventId;
use crate::crisis::monitor::MonitorChange;

/// バッファサイズ。遅いサブスクライバーはこれを超えると古いイベントを失う（lagged）。
pub const BROADCAST_CAPACITY: usize = 256;

/// 購読者に配信されるイベント
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorEvent {
    /// 状態機械の変化
    Changed(MonitorChange),

    /// エスカレーションがカウンセラー窓口に届いた
    EscalationDelivered {
        event_id: CrisisEventId,
        sink: &'static str,
    },

    /// エスカレーションの配送に失敗した（再試行可能）
    EscalationFailed {
        event_id: CrisisEventId,
        reason: String,
    },
}

/// モニターイベントのブロードキャスター
#[derive(Debug, Clone)]
pub struct MonitorBroadcaster {
    sender: broadcast::Sender<MonitorEvent>,
}

impl MonitorBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// 新しいサブスクリプションを作成
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// 全サブスクライバーに通知（購読者がいなければ破棄）
    pub fn broadcast(&self, event: MonitorEvent) {
        let _ = self.sender.send(event);
    }

    /// 状態機械の変化をまとめて通知
    pub fn broadcast_changes(&self, changes: impl IntoIterator<Item = MonitorChange>) {
        for change in changes {
            self.broadcast(MonitorEvent::Changed(change));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MonitorBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
