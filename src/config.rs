//! 設定
//!
//! モニターの閾値・間隔、ログ出力、緊急連絡先をTOMLで保持する。
//! 既定の保存先は XDG 設定ディレクトリの `care-compass/config.toml`。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::crisis::history::DEFAULT_HISTORY_CAPACITY;
use crate::crisis::risk::RiskThresholds;
use crate::error::MonitorError;

/// エスカレーション時の既定トリガー
pub const DEFAULT_TRIGGERS: [&str; 2] = ["emotional distress", "voice analysis"];

/// 書き起こしが無い場合の既定文言
pub const DEFAULT_TRANSCRIPT: &str = "Voice analysis detected high emotional distress";

/// 危機モニター設定
///
/// 閾値・間隔はデモ値であり臨床的根拠はないため、すべて設定可能にしている。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// サンプリング間隔（ミリ秒）
    pub sample_interval_ms: u64,
    /// カウンセラー接続までのカウントダウン（秒）
    pub countdown_secs: u32,
    /// カウントダウン1ステップの間隔（ミリ秒）
    pub countdown_tick_ms: u64,
    /// 危機イベント履歴の保持件数
    pub history_capacity: usize,
    /// エスカレーション時に記録するトリガー
    pub default_triggers: Vec<String>,
    /// 書き起こしが無い場合の文言
    pub default_transcript: String,
    /// リスク帯の閾値
    pub thresholds: RiskThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 3_000,
            countdown_secs: 60,
            countdown_tick_ms: 1_000,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_triggers: DEFAULT_TRIGGERS.iter().map(|s| s.to_string()).collect(),
            default_transcript: DEFAULT_TRANSCRIPT.to_string(),
            thresholds: RiskThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    /// 設定値の整合性チェック
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.sample_interval_ms == 0 {
            return Err(MonitorError::InvalidConfig(
                "sample_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.countdown_tick_ms == 0 {
            return Err(MonitorError::InvalidConfig(
                "countdown_tick_ms must be greater than 0".to_string(),
            ));
        }
        if self.countdown_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "countdown_secs must be greater than 0".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(MonitorError::InvalidConfig(
                "history_capacity must be greater than 0".to_string(),
            ));
        }
        self.thresholds.validate()
    }
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// ログファイル名の接頭辞（日付が付与される）
    pub log_filename_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            log_filename_prefix: "care-compass.log".to_string(),
        }
    }
}

/// 緊急連絡先
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub number: String,
}

impl EmergencyContact {
    pub fn new(name: impl Into<String>, number: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            number: number.into(),
        }
    }
}

/// 既定の緊急連絡先（インド）
pub fn default_emergency_contacts() -> Vec<EmergencyContact> {
    vec![
        EmergencyContact::new("India Emergency", "102"),
        EmergencyContact::new("KIRAN", "1800-599-0019"),
        EmergencyContact::new("Vandrevala", "1860-2662-345"),
    ]
}

/// アプリケーション設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 危機モニター設定
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// ログ設定
    #[serde(default)]
    pub log: LogConfig,

    /// 緊急連絡先
    #[serde(default = "default_emergency_contacts")]
    pub emergency_contacts: Vec<EmergencyContact>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            log: LogConfig::default(),
            emergency_contacts: default_emergency_contacts(),
        }
    }
}

const QUALIFIER: &str = "org";
const ORGANIZATION: &str = "carecompass";
const APPLICATION: &str = "care-compass";
const CONFIG_FILE_NAME: &str = "config.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// 設定ファイルの読み書き
///
/// 保存は一時ファイルへ書いてから置き換えるため、途中で落ちても
/// 壊れた設定ファイルは残らない。
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDG設定ディレクトリ配下の `config.toml` を使う
    pub fn new() -> Result<Self> {
        let dirs = project_dirs().context("Failed to resolve XDG config directory")?;
        Self::with_path(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// 任意のパスを使う（親ディレクトリは作成する）
    pub fn with_path(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        debug!("Config file path: {}", config_path.display());
        Ok(Self { config_path })
    }

    /// XDGデータディレクトリ配下の既定ログディレクトリ
    pub fn default_log_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_local_dir().join("logs"))
    }

    /// 設定を読み込み（ファイルが無ければ既定値）
    pub fn load_config(&self) -> Result<AppConfig> {
        let content = match fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", self.config_path.display());
                return Ok(AppConfig::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.config_path.display()))
            }
        };

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Malformed TOML in {}", self.config_path.display()))?;
        config
            .monitor
            .validate()
            .with_context(|| format!("Invalid settings in {}", self.config_path.display()))?;

        info!("✅ Configuration loaded from: {}", self.config_path.display());
        Ok(config)
    }

    /// 設定を保存（不正なモニター設定は書き込まない）
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        config.monitor.validate().context("Refusing to save invalid settings")?;
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        let staging = self.config_path.with_extension("toml.tmp");
        fs::write(&staging, content)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        fs::rename(&staging, &self.config_path)
            .with_context(|| format!("Failed to replace {}", self.config_path.display()))?;

        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 既定値で上書き
    pub fn reset_config(&self) -> Result<()> {
        self.save_config(&AppConfig::default())?;
        info!("🔄 Configuration reset to defaults");
        Ok(())
    }

    pub fn config_exists(&self) -> bool {
        self.config_path.is_file()
    }

    /// 日時付きのバックアップを作成
    pub fn backup_config(&self) -> Result<PathBuf> {
        if !self.config_exists() {
            anyhow::bail!("Nothing to back up at {}", self.config_path.display());
        }

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let backup_path = self.config_path.with_extension(format!("toml.{}.bak", stamp));
        fs::copy(&self.config_path, &backup_path)
            .with_context(|| format!("Failed to back up to {}", backup_path.display()))?;

        info!("📦 Configuration backed up to: {}", backup_path.display());
        Ok(backup_path)
    }
}
