//! 危機イベント履歴
//!
//! 容量を超えると最も古いイベントから破棄する循環バッファ。
//! 取得は常に新しい順。

use std::collections::VecDeque;

use super::event::{CrisisEvent, CrisisEventId};

/// 既定の保持件数
pub const DEFAULT_HISTORY_CAPACITY: usize = 5;

#[derive(Debug, Clone)]
pub struct CrisisHistory {
    /// 先頭が最新
    buffer: VecDeque<CrisisEvent>,
    capacity: usize,
    /// 破棄されたイベント数の累計
    evicted_count: usize,
    /// 記録されたイベント数の累計（破棄分を含む）
    total_count: usize,
}

impl CrisisHistory {
    /// 容量0は1として扱う
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            evicted_count: 0,
            total_count: 0,
        }
    }

    /// イベントを追加（容量超過分は古い順に破棄）
    pub fn push(&mut self, event: CrisisEvent) {
        self.buffer.push_front(event);
        self.total_count += 1;
        while self.buffer.len() > self.capacity {
            if let Some(evicted) = self.buffer.pop_back() {
                self.evicted_count += 1;
                tracing::debug!("🧹 [HISTORY] Evicted crisis event {}", evicted.id());
            }
        }
    }

    /// 新しい順のイテレーター
    pub fn iter(&self) -> impl Iterator<Item = &CrisisEvent> {
        self.buffer.iter()
    }

    /// 新しい順のベクタ
    pub fn to_vec(&self) -> Vec<CrisisEvent> {
        self.buffer.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&CrisisEvent> {
        self.buffer.front()
    }

    pub fn get(&self, id: CrisisEventId) -> Option<&CrisisEvent> {
        self.buffer.iter().find(|event| event.id() == id)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted_count(&self) -> usize {
        self.evicted_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }
}

impl Default for CrisisHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
