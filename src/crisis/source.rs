//! 感情スコアのサンプリングソース
//!
//! 実際の音声解析は行わない。合成乱数・固定スクリプト・利用不可の3種類。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::risk::EmotionScore;
use crate::error::SourceError;

/// サンプリングソーストレイト
pub trait EmotionSource: Send {
    /// 次のスコアを取得
    fn sample(&mut self) -> Result<EmotionScore, SourceError>;

    /// ソース名を取得
    fn name(&self) -> &'static str;
}

impl<S: EmotionSource + ?Sized> EmotionSource for Box<S> {
    fn sample(&mut self) -> Result<EmotionScore, SourceError> {
        (**self).sample()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// 一様乱数でスコアを生成する合成ソース
#[derive(Debug)]
pub struct SyntheticSource {
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// 再現可能なシード付きで作成
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EmotionSource for SyntheticSource {
    fn sample(&mut self) -> Result<EmotionScore, SourceError> {
        let value: f64 = self.rng.gen_range(EmotionScore::MIN..EmotionScore::MAX);
        Ok(EmotionScore::clamped(value))
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

/// 尽きた後の振る舞い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEnd {
    /// 最後の値を返し続ける
    RepeatLast,
    /// 先頭から繰り返す
    Cycle,
    /// `SourceError::Exhausted` を返す
    Fail,
}

/// 固定シーケンスを順に返すソース
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    scores: Vec<EmotionScore>,
    position: usize,
    end: ScriptEnd,
}

impl ScriptedSource {
    pub fn new(scores: Vec<EmotionScore>, end: ScriptEnd) -> Self {
        Self {
            scores,
            position: 0,
            end,
        }
    }

    /// 生の数値列から作成（範囲外は丸める）
    pub fn from_values(values: &[f64], end: ScriptEnd) -> Self {
        Self::new(
            values.iter().copied().map(EmotionScore::clamped).collect(),
            end,
        )
    }

    /// カンマ区切り文字列（"10,50,85"）から作成
    pub fn parse(text: &str, end: ScriptEnd) -> Result<Self, crate::error::MonitorError> {
        let scores = text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>()
                    .map_err(|_| crate::error::MonitorError::InvalidScore(f64::NAN))
                    .and_then(EmotionScore::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(scores, end))
    }

    /// 返却済みの件数
    pub fn consumed(&self) -> usize {
        self.position
    }
}

impl EmotionSource for ScriptedSource {
    fn sample(&mut self) -> Result<EmotionScore, SourceError> {
        if self.scores.is_empty() {
            return Err(SourceError::Exhausted);
        }

        if self.position < self.scores.len() {
            let score = self.scores[self.position];
            self.position += 1;
            return Ok(score);
        }

        match self.end {
            ScriptEnd::RepeatLast => Ok(self.scores[self.scores.len() - 1]),
            ScriptEnd::Cycle => {
                let score = self.scores[self.position % self.scores.len()];
                self.position += 1;
                Ok(score)
            }
            ScriptEnd::Fail => Err(SourceError::Exhausted),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// 常に利用不可を返すソース（マイク許可拒否の再現用）
#[derive(Debug, Clone, Default)]
pub struct UnavailableSource;

impl EmotionSource for UnavailableSource {
    fn sample(&mut self) -> Result<EmotionScore, SourceError> {
        Err(SourceError::PermissionDenied)
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
