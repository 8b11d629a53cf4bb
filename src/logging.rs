//! ログ初期化

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{ConfigManager, LogConfig};

/// ログレベル設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl DebugLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            DebugLevel::Off => "off",
            DebugLevel::Error => "error",
            DebugLevel::Warn => "warn",
            DebugLevel::Info => "info",
            DebugLevel::Debug => "debug",
            DebugLevel::Trace => "trace",
        }
    }

    /// 設定文字列から変換（不明な値はInfo）
    pub fn parse(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "off" => DebugLevel::Off,
            "error" => DebugLevel::Error,
            "warn" | "warning" => DebugLevel::Warn,
            "debug" => DebugLevel::Debug,
            "trace" => DebugLevel::Trace,
            _ => DebugLevel::Info,
        }
    }
}

/// ログ初期化
///
/// `RUST_LOG` が設定されていればそちらを優先する。
/// ファイル出力有効時は日次ローテーションのファイルレイヤーを追加し、
/// 書き込みスレッドのガードを返す（呼び出し側で保持すること）。
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = DebugLevel::parse(&config.log_level);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_filter()))
        .context("Failed to build log filter")?;

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let (file_layer, guard) = match file_writer(config)? {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(dir) = config.log_dir.as_ref().filter(|_| config.enable_file_logging) {
        tracing::info!("📝 File logging enabled: {}", dir.display());
    }

    Ok(guard)
}

/// 日次ローテーションのファイル出力先（無効なら `None`）
fn file_writer(config: &LogConfig) -> anyhow::Result<Option<(NonBlocking, WorkerGuard)>> {
    if !config.enable_file_logging {
        return Ok(None);
    }

    let log_dir = config
        .log_dir
        .clone()
        .or_else(ConfigManager::default_log_dir)
        .context("No log directory available")?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(&log_dir, &config.log_filename_prefix);
    Ok(Some(tracing_appender::non_blocking(appender)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_debug_level_parse() {
        assert_eq!(DebugLevel::parse("DEBUG"), DebugLevel::Debug);
        assert_eq!(DebugLevel::parse("warning"), DebugLevel::Warn);
        assert_eq!(DebugLevel::parse("nonsense"), DebugLevel::Info);
        assert_eq!(DebugLevel::parse("off").as_filter(), "off");
    }

    #[test]
    fn test_file_writer_disabled() {
        let config = LogConfig {
            enable_file_logging: false,
            ..LogConfig::default()
        };
        assert!(file_writer(&config).unwrap().is_none());
    }

    #[test]
    fn test_file_writer_rolls_into_prefixed_file() {
        let temp = tempfile::tempdir().unwrap();
        let log_dir = temp.path().join("logs");
        let config = LogConfig {
            enable_file_logging: true,
            log_dir: Some(log_dir.clone()),
            log_filename_prefix: "care-compass".to_string(),
            log_level: "info".to_string(),
        };

        let (mut writer, guard) = file_writer(&config).unwrap().unwrap();
        writer.write_all(b"crisis pending\n").unwrap();
        // ガード破棄で書き込みを完了させる
        drop(guard);

        let names: Vec<String> = std::fs::read_dir(&log_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("care-compass."));
    }
}
