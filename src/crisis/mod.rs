//! 危機検知のドメインモデルと状態機械
//!
//! ここにはタイマーもI/Oもない。時間経過は `runtime` 側から
//! ティックとして渡される。

pub mod event; // 危機イベント
pub mod history; // 直近イベントの保持
pub mod monitor; // 監視状態機械
pub mod risk; // リスク分類
pub mod source; // 感情スコアのサンプリングソース

pub use event::{CrisisEvent, CrisisEventId, EscalationTrigger};
pub use history::{CrisisHistory, DEFAULT_HISTORY_CAPACITY};
pub use monitor::{
    CrisisMonitor, MonitorChange, MonitorPhase, MonitorSnapshot, MonitoringSession, TimerArm,
    TimerKind, Transition,
};
pub use risk::{classify, EmotionScore, RiskLevel, RiskThresholds};
pub use source::{EmotionSource, ScriptEnd, ScriptedSource, SyntheticSource, UnavailableSource};
