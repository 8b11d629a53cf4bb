//! 危機リスクモニター（状態機械）
//!
//! `Idle → Monitoring → (CrisisPending ⇄ Monitoring) → Idle` と、
//! サンプリングソース障害時の `Unavailable` を持つ。
//!
//! タイマーそのものは持たず、各遷移がどのタイマーを起動・解放すべきかを
//! [`Transition`] として返す。実時間での駆動は `runtime::service` が担う。
//! カウントダウンの起動ごとに世代番号を振り、古い世代のティックは無視する。

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::event::{CrisisEvent, EscalationTrigger};
use super::history::CrisisHistory;
use super::risk::{EmotionScore, RiskLevel};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, SourceError};

/// モニターのフェーズ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    #[default]
    Idle,
    Monitoring,
    CrisisPending,
    /// サンプリングソースが利用できない
    Unavailable,
}

impl MonitorPhase {
    /// サンプリングタイマーを保持するフェーズか
    pub fn is_active(&self) -> bool {
        matches!(self, MonitorPhase::Monitoring | MonitorPhase::CrisisPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorPhase::Idle => "idle",
            MonitorPhase::Monitoring => "monitoring",
            MonitorPhase::CrisisPending => "crisis_pending",
            MonitorPhase::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// モニターが所有するタイマーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// 感情スコアの定期サンプリング
    Sampling,
    /// 1秒ごとのカウントダウン
    Countdown,
}

/// タイマー起動要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerArm {
    pub kind: TimerKind,
    pub generation: u64,
    pub period: Duration,
}

/// 状態変化の通知
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorChange {
    Started,
    Stopped,
    Sampled {
        score: EmotionScore,
        risk: RiskLevel,
    },
    RiskChanged {
        from: RiskLevel,
        to: RiskLevel,
    },
    CrisisArmed {
        countdown_secs: u32,
    },
    CountdownTick {
        remaining_secs: u32,
    },
    Dismissed,
    Escalated(CrisisEvent),
    SourceUnavailable {
        reason: SourceError,
    },
}

/// 遷移結果: 起動・解放すべきタイマーと発生した変化
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub arm: Vec<TimerArm>,
    pub release: Vec<TimerKind>,
    pub changes: Vec<MonitorChange>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.arm.is_empty() && self.release.is_empty() && self.changes.is_empty()
    }

    /// この遷移で記録された危機イベント
    pub fn escalated_event(&self) -> Option<&CrisisEvent> {
        self.changes.iter().find_map(|change| match change {
            MonitorChange::Escalated(event) => Some(event),
            _ => None,
        })
    }

    pub fn arms(&self, kind: TimerKind) -> bool {
        self.arm.iter().any(|arm| arm.kind == kind)
    }

    pub fn releases(&self, kind: TimerKind) -> bool {
        self.release.contains(&kind)
    }
}

/// 監視中のみ存在するセッション状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSession {
    pub is_monitoring: bool,
    pub is_listening: bool,
    pub current_risk_level: RiskLevel,
    pub emotion_score: EmotionScore,
    pub countdown_seconds: u32,
    /// 次のエスカレーションに添付する書き起こし
    pub transcript: Option<String>,
}

impl MonitoringSession {
    fn idle(countdown_secs: u32) -> Self {
        Self {
            is_monitoring: false,
            is_listening: false,
            current_risk_level: RiskLevel::Safe,
            emotion_score: EmotionScore::default(),
            countdown_seconds: countdown_secs,
            transcript: None,
        }
    }

    fn active(countdown_secs: u32) -> Self {
        Self {
            is_monitoring: true,
            is_listening: true,
            ..Self::idle(countdown_secs)
        }
    }
}

/// 描画側に渡す読み取り専用スナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub phase: MonitorPhase,
    pub session: MonitoringSession,
    pub unavailable_reason: Option<String>,
    pub history_len: usize,
    pub sample_count: u64,
}

impl MonitorSnapshot {
    pub fn is_crisis_pending(&self) -> bool {
        self.phase == MonitorPhase::CrisisPending
    }
}

/// 現在起動中のタイマー世代
#[derive(Debug, Clone, Copy, Default)]
struct ArmedTimers {
    sampling: Option<u64>,
    countdown: Option<u64>,
}

/// 危機リスクモニター
#[derive(Debug)]
pub struct CrisisMonitor {
    config: MonitorConfig,
    phase: MonitorPhase,
    session: MonitoringSession,
    history: CrisisHistory,
    armed: ArmedTimers,
    next_generation: u64,
    sample_count: u64,
    unavailable_reason: Option<SourceError>,
}

impl CrisisMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// 既定設定で作成
    pub fn with_defaults() -> Self {
        Self::build(MonitorConfig::default())
    }

    fn build(config: MonitorConfig) -> Self {
        Self {
            phase: MonitorPhase::Idle,
            session: MonitoringSession::idle(config.countdown_secs),
            history: CrisisHistory::new(config.history_capacity),
            armed: ArmedTimers::default(),
            next_generation: 0,
            sample_count: 0,
            unavailable_reason: None,
            config,
        }
    }

    /// 監視開始
    pub fn start(&mut self) -> Transition {
        if self.phase.is_active() {
            tracing::debug!("🔁 [MONITOR] start() ignored, already {}", self.phase);
            return Transition::default();
        }

        let mut transition = Transition::default();
        self.phase = MonitorPhase::Monitoring;
        self.session = MonitoringSession::active(self.config.countdown_secs);
        self.unavailable_reason = None;
        self.sample_count = 0;

        let generation = self.bump_generation();
        self.armed.sampling = Some(generation);
        transition.arm.push(TimerArm {
            kind: TimerKind::Sampling,
            generation,
            period: self.config.sample_interval(),
        });
        transition.changes.push(MonitorChange::Started);

        tracing::info!(
            "🎙️ [MONITOR] Monitoring started (interval: {:?})",
            self.config.sample_interval()
        );
        transition
    }

    /// 監視停止（冪等）
    pub fn stop(&mut self) -> Transition {
        if self.phase == MonitorPhase::Idle {
            return Transition::default();
        }

        let mut transition = Transition::default();
        self.release_all(&mut transition);
        self.phase = MonitorPhase::Idle;
        self.session = MonitoringSession::idle(self.config.countdown_secs);
        self.unavailable_reason = None;
        transition.changes.push(MonitorChange::Stopped);

        tracing::info!("🛑 [MONITOR] Monitoring stopped");
        transition
    }

    /// サンプリング結果を反映
    pub fn record_sample(&mut self, score: EmotionScore) -> Result<Transition, MonitorError> {
        if !self.phase.is_active() {
            return Err(MonitorError::invalid_transition("sample", self.phase));
        }

        let mut transition = Transition::default();
        let previous = self.session.current_risk_level;
        let risk = self.config.thresholds.classify(score);

        self.sample_count += 1;
        self.session.emotion_score = score;
        self.session.current_risk_level = risk;
        transition
            .changes
            .push(MonitorChange::Sampled { score, risk });

        if risk != previous {
            tracing::info!("📈 [MONITOR] Risk level {} -> {} ({})", previous, risk, score);
            transition.changes.push(MonitorChange::RiskChanged {
                from: previous,
                to: risk,
            });
        }

        // 保留中でも高リスク帯へのレベル変化ではカウントダウンを初期値からやり直す
        let should_arm = match self.phase {
            MonitorPhase::Monitoring => risk.requires_intervention(),
            MonitorPhase::CrisisPending => risk.requires_intervention() && risk != previous,
            _ => false,
        };
        if should_arm {
            self.arm_countdown(&mut transition);
        }

        Ok(transition)
    }

    /// サンプリングタイマーからのティック（世代が古ければ無視）
    pub fn sampling_result(
        &mut self,
        generation: u64,
        result: Result<EmotionScore, SourceError>,
    ) -> Transition {
        if self.armed.sampling != Some(generation) {
            tracing::debug!("⏭️ [MONITOR] Stale sampling tick ignored (gen {})", generation);
            return Transition::default();
        }

        match result {
            Ok(score) => self.record_sample(score).unwrap_or_default(),
            Err(reason) => self.source_failed(reason),
        }
    }

    /// カウントダウンタイマーからの1秒ティック
    pub fn countdown_tick(&mut self, generation: u64) -> Transition {
        if self.phase != MonitorPhase::CrisisPending || self.armed.countdown != Some(generation) {
            tracing::debug!(
                "⏭️ [MONITOR] Stale countdown tick ignored (gen {}, phase {})",
                generation,
                self.phase
            );
            return Transition::default();
        }

        let mut transition = Transition::default();
        self.session.countdown_seconds = self.session.countdown_seconds.saturating_sub(1);
        transition.changes.push(MonitorChange::CountdownTick {
            remaining_secs: self.session.countdown_seconds,
        });

        if self.session.countdown_seconds == 0 {
            tracing::warn!("⏰ [MONITOR] Countdown expired, escalating automatically");
            self.escalate_inner(EscalationTrigger::CountdownExpired, &mut transition);
        }

        transition
    }

    /// ユーザーが安全を申告
    pub fn dismiss(&mut self) -> Result<Transition, MonitorError> {
        if self.phase != MonitorPhase::CrisisPending {
            return Err(MonitorError::invalid_transition("dismiss", self.phase));
        }

        let mut transition = Transition::default();
        self.release_countdown(&mut transition);
        self.session.countdown_seconds = self.config.countdown_secs;
        self.phase = MonitorPhase::Monitoring;
        transition.changes.push(MonitorChange::Dismissed);

        tracing::info!("🙆 [MONITOR] Crisis dismissed by user");
        Ok(transition)
    }

    /// 人間のカウンセラーへ即時エスカレーション
    pub fn escalate(&mut self) -> Result<Transition, MonitorError> {
        if !self.phase.is_active() {
            return Err(MonitorError::invalid_transition("escalate", self.phase));
        }

        let mut transition = Transition::default();
        self.escalate_inner(EscalationTrigger::Manual, &mut transition);
        Ok(transition)
    }

    /// サンプリングソース障害: すべてのタイマーを解放して `Unavailable` へ
    pub fn source_failed(&mut self, reason: SourceError) -> Transition {
        let mut transition = Transition::default();
        if !self.phase.is_active() {
            return transition;
        }

        tracing::error!("🚫 [MONITOR] Sampling source unavailable: {}", reason);
        self.release_all(&mut transition);
        self.phase = MonitorPhase::Unavailable;
        self.session = MonitoringSession::idle(self.config.countdown_secs);
        self.unavailable_reason = Some(reason.clone());
        transition
            .changes
            .push(MonitorChange::SourceUnavailable { reason });
        transition
    }

    /// 次のエスカレーションに添付する書き起こしを設定
    pub fn set_transcript(&mut self, transcript: Option<String>) {
        if self.phase.is_active() {
            self.session.transcript = transcript.filter(|t| !t.trim().is_empty());
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            phase: self.phase,
            session: self.session.clone(),
            unavailable_reason: self.unavailable_reason.as_ref().map(ToString::to_string),
            history_len: self.history.len(),
            sample_count: self.sample_count,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn session(&self) -> &MonitoringSession {
        &self.session
    }

    pub fn history(&self) -> &CrisisHistory {
        &self.history
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn unavailable_reason(&self) -> Option<&SourceError> {
        self.unavailable_reason.as_ref()
    }

    /// 現在所有しているタイマー
    pub fn active_timers(&self) -> Vec<TimerKind> {
        let mut timers = Vec::new();
        if self.armed.sampling.is_some() {
            timers.push(TimerKind::Sampling);
        }
        if self.armed.countdown.is_some() {
            timers.push(TimerKind::Countdown);
        }
        timers
    }

    /// 起動中のカウントダウン世代
    pub fn countdown_generation(&self) -> Option<u64> {
        self.armed.countdown
    }

    /// 起動中のサンプリング世代
    pub fn sampling_generation(&self) -> Option<u64> {
        self.armed.sampling
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn arm_countdown(&mut self, transition: &mut Transition) {
        let generation = self.bump_generation();
        self.armed.countdown = Some(generation);
        self.session.countdown_seconds = self.config.countdown_secs;
        self.phase = MonitorPhase::CrisisPending;

        transition.arm.push(TimerArm {
            kind: TimerKind::Countdown,
            generation,
            period: self.config.countdown_tick(),
        });
        transition.changes.push(MonitorChange::CrisisArmed {
            countdown_secs: self.config.countdown_secs,
        });

        tracing::warn!(
            "🚨 [MONITOR] Crisis pending at {} ({}), countdown {}s",
            self.session.current_risk_level,
            self.session.emotion_score,
            self.config.countdown_secs
        );
    }

    fn escalate_inner(&mut self, trigger: EscalationTrigger, transition: &mut Transition) {
        let transcript = self
            .session
            .transcript
            .take()
            .unwrap_or_else(|| self.config.default_transcript.clone());

        let event = CrisisEvent::escalated(
            self.session.current_risk_level,
            self.session.emotion_score,
            self.config.default_triggers.clone(),
            Some(transcript),
            trigger,
            Utc::now(),
        );

        tracing::warn!(
            "📞 [MONITOR] Escalating to human counselor: {} ({:?})",
            event.id(),
            trigger
        );

        self.history.push(event.clone());
        self.release_countdown(transition);
        self.session.countdown_seconds = self.config.countdown_secs;
        self.phase = MonitorPhase::Monitoring;
        transition.changes.push(MonitorChange::Escalated(event));
    }

    fn release_countdown(&mut self, transition: &mut Transition) {
        if self.armed.countdown.take().is_some() {
            transition.release.push(TimerKind::Countdown);
        }
    }

    fn release_all(&mut self, transition: &mut Transition) {
        if self.armed.sampling.take().is_some() {
            transition.release.push(TimerKind::Sampling);
        }
        self.release_countdown(transition);
    }
}
