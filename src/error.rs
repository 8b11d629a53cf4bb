//! エラー型定義
//!
//! 状態機械・サンプリングソース・エスカレーション配送のエラーを分類し、
//! クレート全体で使う `CareCompassError` にまとめる。

use thiserror::Error;

use crate::crisis::event::CrisisEventId;
use crate::crisis::monitor::MonitorPhase;

/// 感情スコアの取得元で発生するエラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    /// マイク等の利用許可が得られなかった
    #[error("サンプリングソースの利用が許可されていません")]
    PermissionDenied,

    /// スクリプト化されたソースが尽きた
    #[error("サンプリングソースのデータが尽きました")]
    Exhausted,
}

/// 危機モニターの操作エラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MonitorError {
    /// 範囲外またはNaNのスコア
    #[error("Invalid emotion score: {0} (expected 0..=100)")]
    InvalidScore(f64),

    /// 現在のフェーズでは許可されない操作
    #[error("Operation '{operation}' is not allowed in phase {phase}")]
    InvalidTransition {
        operation: &'static str,
        phase: MonitorPhase,
    },

    /// サンプリングソースの失敗
    #[error("Sampling source failed: {0}")]
    Source(#[from] SourceError),

    /// 設定値の不整合
    #[error("Invalid monitor configuration: {0}")]
    InvalidConfig(String),
}

impl MonitorError {
    pub(crate) fn invalid_transition(operation: &'static str, phase: MonitorPhase) -> Self {
        Self::InvalidTransition { operation, phase }
    }
}

/// エスカレーション配送エラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EscalationError {
    #[error("カウンセラー窓口に接続できません: {0}")]
    Unreachable(String),

    #[error("エスカレーションキューが閉じています")]
    QueueClosed,

    #[error("未配送のイベントが見つかりません: {0}")]
    UnknownEvent(CrisisEventId),
}

/// クレート全体のエラー型
#[derive(Debug, Error)]
pub enum CareCompassError {
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Escalation error: {0}")]
    Escalation(#[from] EscalationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    General(#[from] anyhow::Error),
}

impl From<SourceError> for CareCompassError {
    fn from(err: SourceError) -> Self {
        CareCompassError::Monitor(MonitorError::Source(err))
    }
}

pub type CareCompassResult<T> = Result<T, CareCompassError>;
