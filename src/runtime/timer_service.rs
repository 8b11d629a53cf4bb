//! タイマーサービス
//!
//! サンプリング・カウントダウンなどの時間ベース処理を精密制御
//! - タイマーライフサイクル管理
//! - 再起動時の旧タスク確実キャンセル
//! - 停止・破棄時の全タスク解放

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::crisis::monitor::TimerKind;

/// タイマータスクのID
pub type TimerId = String;

/// タイマータスクの設定
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// 初回実行までの遅延
    pub delay: Duration,
    /// 繰り返し間隔
    pub interval: Duration,
}

impl TimerConfig {
    /// 定期実行用設定（初回も1間隔後、setInterval相当）
    pub fn periodic(interval: Duration) -> Self {
        Self {
            delay: interval,
            interval,
        }
    }
}

/// タイマータスクの実行結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerResult {
    /// 継続実行
    Continue,
    /// 完了（タスク終了）
    Complete,
}

/// タイマータスクのハンドラー
pub type TimerHandler = Box<dyn Fn() -> TimerResult + Send + Sync>;

/// タイマータスクの内部状態
#[derive(Debug)]
struct TimerTask {
    kind: TimerKind,
    /// 同一IDで再起動された場合に旧タスクを区別する番号
    instance: u64,
    cancel_sender: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, Copy)]
enum CompletionReason {
    Completed,
    Cancelled,
}

/// タイマーサービス
#[derive(Debug, Default)]
pub struct TimerService {
    /// アクティブなタスク
    active_tasks: Arc<Mutex<HashMap<TimerId, TimerTask>>>,
    next_instance: Mutex<u64>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// タイマータスクを開始（同じIDの既存タスクはキャンセル）
    ///
    /// tokioランタイム内から呼び出すこと。
    pub fn start_task<F>(&self, id: impl Into<TimerId>, kind: TimerKind, config: TimerConfig, handler: F)
    where
        F: Fn() -> TimerResult + Send + Sync + 'static,
    {
        let id = id.into();

        // 既存タスクのキャンセル
        self.cancel_task(&id);

        let (cancel_sender, cancel_receiver) = oneshot::channel();
        let instance = {
            let mut next = self.next_instance.lock();
            *next += 1;
            *next
        };

        self.active_tasks.lock().insert(
            id.clone(),
            TimerTask {
                kind,
                instance,
                cancel_sender: Some(cancel_sender),
            },
        );

        tokio::spawn(Self::execute_task(
            id.clone(),
            instance,
            config,
            Box::new(handler),
            cancel_receiver,
            Arc::clone(&self.active_tasks),
        ));

        tracing::debug!("⏱️ [TIMER] Started task: {} ({:?}, every {:?})", id, kind, config.interval);
    }

    /// タスクの実行処理
    async fn execute_task(
        task_id: TimerId,
        instance: u64,
        config: TimerConfig,
        handler: TimerHandler,
        mut cancel_receiver: oneshot::Receiver<()>,
        active_tasks: Arc<Mutex<HashMap<TimerId, TimerTask>>>,
    ) {
        let finish = |reason| Self::complete_task(&task_id, instance, reason, &active_tasks);

        let mut wait = config.delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = &mut cancel_receiver => {
                    finish(CompletionReason::Cancelled);
                    return;
                }
            }

            // スリープ終了と同時にキャンセルされた場合はハンドラーを呼ばない
            if !matches!(
                cancel_receiver.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ) {
                finish(CompletionReason::Cancelled);
                return;
            }

            if handler() == TimerResult::Complete {
                finish(CompletionReason::Completed);
                return;
            }
            wait = config.interval;
        }
    }

    /// タスクの完了処理
    fn complete_task(
        task_id: &str,
        instance: u64,
        reason: CompletionReason,
        active_tasks: &Arc<Mutex<HashMap<TimerId, TimerTask>>>,
    ) {
        // 自分のインスタンスのときだけ登録解除（再起動後の新タスクは残す）
        let mut tasks = active_tasks.lock();
        if tasks.get(task_id).map(|task| task.instance) == Some(instance) {
            tasks.remove(task_id);
        }

        tracing::debug!("⏱️ [TIMER] Task finished: {} ({:?})", task_id, reason);
    }

    /// タスクをキャンセル
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let sender = self
            .active_tasks
            .lock()
            .remove(task_id)
            .and_then(|mut task| task.cancel_sender.take());

        match sender {
            Some(sender) => {
                let _ = sender.send(());
                tracing::debug!("⏱️ [TIMER] Cancelled task: {}", task_id);
                true
            }
            None => false,
        }
    }

    /// 全タスクをキャンセル
    pub fn cancel_all_tasks(&self) -> u32 {
        let task_ids: Vec<TimerId> = self.active_tasks.lock().keys().cloned().collect();

        let cancelled = task_ids
            .iter()
            .filter(|task_id| self.cancel_task(task_id))
            .count() as u32;

        if cancelled > 0 {
            tracing::info!("⏱️ [TIMER] Cancelled all {} tasks", cancelled);
        }

        cancelled
    }

    /// アクティブなタスク一覧を取得
    pub fn get_active_tasks(&self) -> Vec<(TimerId, TimerKind)> {
        self.active_tasks
            .lock()
            .iter()
            .map(|(id, task)| (id.clone(), task.kind))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_tasks.lock().len()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.cancel_all_tasks();
    }
}
