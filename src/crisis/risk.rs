//! リスクレベル分類
//!
//! 感情スコア（0〜100）を閾値帯で離散的なリスクレベルに変換する。
//! 閾値は厳密な `>` 比較で、境界値は下位の帯に属する。

use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

/// リスクレベル（深刻度順に全順序）
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// 全レベル（深刻度の昇順）
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Safe,
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    /// カウントダウンを起動すべきレベルか
    pub fn requires_intervention(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// 感情スコア（0.0〜100.0）
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct EmotionScore(f64);

impl EmotionScore {
    pub const MIN: f64 = 0.0;
    pub const MAX: f64 = 100.0;

    /// 範囲チェック付きで作成
    pub fn new(value: f64) -> Result<Self, MonitorError> {
        if value.is_nan() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(MonitorError::InvalidScore(value));
        }
        Ok(Self(value))
    }

    /// 範囲外の値を丸めて作成（NaNは0扱い）
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self(Self::MIN);
        }
        Self(value.clamp(Self::MIN, Self::MAX))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// 表示用の整数パーセント
    pub fn rounded(&self) -> u8 {
        self.0.round() as u8
    }
}

impl TryFrom<f64> for EmotionScore {
    type Error = MonitorError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EmotionScore> for f64 {
    fn from(score: EmotionScore) -> Self {
        score.0
    }
}

impl std::fmt::Display for EmotionScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.rounded())
    }
}

/// リスク帯の下限閾値（各値を「超えた」ときにそのレベル）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 25.0,
            medium: 45.0,
            high: 65.0,
            critical: 80.0,
        }
    }
}

impl RiskThresholds {
    /// スコアをリスクレベルに分類
    pub fn classify(&self, score: EmotionScore) -> RiskLevel {
        let value = score.value();
        if value > self.critical {
            RiskLevel::Critical
        } else if value > self.high {
            RiskLevel::High
        } else if value > self.medium {
            RiskLevel::Medium
        } else if value > self.low {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }

    /// 閾値が範囲内かつ厳密に昇順であることを確認
    pub fn validate(&self) -> Result<(), MonitorError> {
        let bands = [self.low, self.medium, self.high, self.critical];
        if bands
            .iter()
            .any(|v| v.is_nan() || !(EmotionScore::MIN..=EmotionScore::MAX).contains(v))
        {
            return Err(MonitorError::InvalidConfig(format!(
                "thresholds must lie within 0..=100: {:?}",
                bands
            )));
        }
        if bands.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(MonitorError::InvalidConfig(format!(
                "thresholds must be strictly ascending: {:?}",
                bands
            )));
        }
        Ok(())
    }
}

/// 既定の閾値でスコアを分類
pub fn classify(score: EmotionScore) -> RiskLevel {
    RiskThresholds::default().classify(score)
}
