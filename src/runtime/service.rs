//! 危機モニターサービス
//!
//! [`CrisisMonitor`] を tokio のタイマーで駆動する。
//! 状態機械が返す [`Transition`] に従ってタイマーを起動・解放し、
//! 変化をブロードキャストし、記録されたイベントを配送キューへ渡す。
//!
//! すべての遷移はモニターのロックを保持したまま適用されるため、
//! サンプリングとカウントダウンのハンドラーは直列に実行される。

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use super::broadcaster::{MonitorBroadcaster, MonitorEvent};
use super::escalation::{EscalationDispatcher, EscalationSink};
use super::timer_service::{TimerConfig, TimerResult, TimerService};
use crate::config::MonitorConfig;
use crate::crisis::event::{CrisisEvent, CrisisEventId};
use crate::crisis::monitor::{CrisisMonitor, MonitorSnapshot, TimerArm, TimerKind, Transition};
use crate::crisis::source::EmotionSource;
use crate::error::{EscalationError, MonitorError};

const SAMPLING_TIMER_ID: &str = "crisis_sampling";
const COUNTDOWN_TIMER_ID: &str = "crisis_countdown";

fn timer_id(kind: TimerKind) -> &'static str {
    match kind {
        TimerKind::Sampling => SAMPLING_TIMER_ID,
        TimerKind::Countdown => COUNTDOWN_TIMER_ID,
    }
}

struct Shared {
    monitor: Mutex<CrisisMonitor>,
    source: Mutex<Box<dyn EmotionSource>>,
    timers: TimerService,
    broadcaster: MonitorBroadcaster,
    dispatcher: EscalationDispatcher,
}

impl Shared {
    /// 遷移を適用（呼び出し側がモニターのロックを保持していること）
    fn apply(self: &Arc<Self>, transition: Transition) {
        for kind in &transition.release {
            self.timers.cancel_task(timer_id(*kind));
        }

        for arm in &transition.arm {
            self.arm_timer(*arm);
        }

        let escalated = transition.escalated_event().cloned();
        self.broadcaster.broadcast_changes(transition.changes);

        if let Some(event) = escalated {
            if let Err(e) = self.dispatcher.dispatch(event) {
                tracing::error!("❌ [MONITOR] Failed to enqueue escalation: {}", e);
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, arm: TimerArm) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let generation = arm.generation;

        self.timers.start_task(
            timer_id(arm.kind),
            arm.kind,
            TimerConfig::periodic(arm.period),
            move || {
                // サービス破棄後に残ったタスクは自然終了させる
                let Some(shared) = weak.upgrade() else {
                    return TimerResult::Complete;
                };
                match arm.kind {
                    TimerKind::Sampling => shared.on_sampling_tick(generation),
                    TimerKind::Countdown => shared.on_countdown_tick(generation),
                }
                TimerResult::Continue
            },
        );
    }

    /// サンプリングティック
    ///
    /// 世代が古いティックではソースを消費しない。ロック順はモニター→ソース。
    fn on_sampling_tick(self: &Arc<Self>, generation: u64) {
        let mut monitor = self.monitor.lock();
        if monitor.sampling_generation() != Some(generation) {
            tracing::debug!("⏭️ [MONITOR] Sampling tick skipped, timer gen {} is gone", generation);
            return;
        }

        let result = self.source.lock().sample();
        let transition = monitor.sampling_result(generation, result);
        self.apply(transition);
    }

    fn on_countdown_tick(self: &Arc<Self>, generation: u64) {
        let mut monitor = self.monitor.lock();
        let transition = monitor.countdown_tick(generation);
        self.apply(transition);
    }
}

/// 危機モニターサービス
///
/// tokioランタイム内で作成すること（配送タスクを起動するため）。
pub struct CrisisMonitorService {
    shared: Arc<Shared>,
}

impl CrisisMonitorService {
    pub fn new(
        config: MonitorConfig,
        source: Box<dyn EmotionSource>,
        sink: Arc<dyn EscalationSink>,
    ) -> Result<Self, MonitorError> {
        let monitor = CrisisMonitor::new(config)?;
        let broadcaster = MonitorBroadcaster::new();
        // 配送タスクはキューが閉じるまで残りを送り切ってから終了する
        let (dispatcher, _worker) = EscalationDispatcher::new(sink, broadcaster.clone());

        tracing::info!("🧭 [MONITOR] Service created (source: {})", source.name());

        Ok(Self {
            shared: Arc::new(Shared {
                monitor: Mutex::new(monitor),
                source: Mutex::new(source),
                timers: TimerService::new(),
                broadcaster,
                dispatcher,
            }),
        })
    }

    /// 監視開始
    pub fn start(&self) -> MonitorSnapshot {
        let mut monitor = self.shared.monitor.lock();
        let transition = monitor.start();
        self.shared.apply(transition);
        monitor.snapshot()
    }

    /// 監視停止（全タイマー解放、冪等）
    pub fn stop(&self) {
        let mut monitor = self.shared.monitor.lock();
        let transition = monitor.stop();
        self.shared.apply(transition);
        // 状態機械が把握していないタスクが残らないよう念のため全解放
        self.shared.timers.cancel_all_tasks();
    }

    /// 危機状態をユーザーが解除
    pub fn dismiss(&self) -> Result<(), MonitorError> {
        let mut monitor = self.shared.monitor.lock();
        let transition = monitor.dismiss()?;
        self.shared.apply(transition);
        Ok(())
    }

    /// 今すぐカウンセラーへ接続
    pub fn escalate(&self) -> Result<CrisisEvent, MonitorError> {
        let mut monitor = self.shared.monitor.lock();
        let transition = monitor.escalate()?;
        let event = transition.escalated_event().cloned();
        self.shared.apply(transition);
        event.ok_or_else(|| MonitorError::invalid_transition("escalate", monitor.phase()))
    }

    /// 次のエスカレーションに添付する書き起こし
    pub fn set_transcript(&self, transcript: Option<String>) {
        self.shared.monitor.lock().set_transcript(transcript);
    }

    /// サンプリングソースを差し替え（許可取得後の再開など）
    pub fn replace_source(&self, source: Box<dyn EmotionSource>) {
        tracing::info!("🔌 [MONITOR] Sampling source replaced: {}", source.name());
        *self.shared.source.lock() = source;
    }

    /// 配送失敗したエスカレーションを再送
    pub fn retry_escalation(&self, event_id: CrisisEventId) -> Result<(), EscalationError> {
        self.shared.dispatcher.retry(event_id)
    }

    pub fn pending_escalations(&self) -> Vec<CrisisEventId> {
        self.shared.dispatcher.pending_ids()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.shared.monitor.lock().snapshot()
    }

    /// 直近の危機イベント（新しい順）
    pub fn recent_events(&self) -> Vec<CrisisEvent> {
        self.shared.monitor.lock().history().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.broadcaster.subscribe()
    }

    /// 実行中のタイマー
    pub fn active_timers(&self) -> Vec<TimerKind> {
        self.shared
            .timers
            .get_active_tasks()
            .into_iter()
            .map(|(_, kind)| kind)
            .collect()
    }

    pub fn active_timer_count(&self) -> usize {
        self.shared.timers.active_count()
    }
}

impl Drop for CrisisMonitorService {
    fn drop(&mut self) {
        self.stop();
    }
}
