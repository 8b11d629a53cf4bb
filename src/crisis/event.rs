//! 危機イベント
//!
//! エスカレーション時にのみ生成される不変レコード。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::risk::{EmotionScore, RiskLevel};

/// 危機イベントID
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CrisisEventId(pub Uuid);

impl CrisisEventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CrisisEventId {
    fn default() -> Self {
        Self::new()
    }
}

/// エスカレーションの契機
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// ユーザーが「今すぐ接続」を選択
    Manual,
    /// カウンセラー接続までのカウントダウンが0になった
    CountdownExpired,
}

/// 危機イベント（作成後は変更不可）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisEvent {
    id: CrisisEventId,
    timestamp: DateTime<Utc>,
    risk_level: RiskLevel,
    triggers: Vec<String>,
    emotion_score: EmotionScore,
    transcript: Option<String>,
    escalated: bool,
    trigger: EscalationTrigger,
}

impl CrisisEvent {
    pub(crate) fn escalated(
        risk_level: RiskLevel,
        emotion_score: EmotionScore,
        triggers: Vec<String>,
        transcript: Option<String>,
        trigger: EscalationTrigger,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CrisisEventId::new(),
            timestamp,
            risk_level,
            triggers,
            emotion_score,
            transcript,
            escalated: true,
            trigger,
        }
    }

    pub fn id(&self) -> CrisisEventId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    pub fn emotion_score(&self) -> EmotionScore {
        self.emotion_score
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated
    }

    pub fn trigger(&self) -> EscalationTrigger {
        self.trigger
    }

    /// 一覧表示用の一行サマリー
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} score={} via {:?}",
            self.timestamp.format("%H:%M:%S"),
            self.risk_level,
            self.emotion_score,
            self.trigger
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> CrisisEvent {
        CrisisEvent::escalated(
            RiskLevel::Critical,
            EmotionScore::new(91.4).unwrap(),
            vec!["emotional distress".to_string()],
            Some("transcript".to_string()),
            EscalationTrigger::CountdownExpired,
            Utc::now(),
        )
    }

    #[test]
    fn test_escalated_event_fields() {
        let event = sample_event();
        assert!(event.is_escalated());
        assert_eq!(event.risk_level(), RiskLevel::Critical);
        assert_eq!(event.triggers(), ["emotional distress".to_string()]);
        assert_eq!(event.transcript(), Some("transcript"));
        assert_eq!(event.trigger(), EscalationTrigger::CountdownExpired);
    }

    #[test]
    fn test_event_ids_are_unique() {
        assert_ne!(sample_event().id(), sample_event().id());
    }

    #[test]
    fn test_summary_contains_level_and_score() {
        let summary = sample_event().summary();
        assert!(summary.contains("CRITICAL"));
        assert!(summary.contains("91%"));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["risk_level"], "critical");
        assert_eq!(json["trigger"], "countdown_expired");
        assert_eq!(json["escalated"], true);
    }
}
