use anyhow::Context;
use care_compass::{
    config::{AppConfig, ConfigManager, LogConfig},
    crisis::{
        CrisisEventId, EmotionScore, EmotionSource, MonitorChange, ScriptEnd, ScriptedSource,
        SyntheticSource, UnavailableSource,
    },
    logging,
    runtime::{CrisisMonitorService, EscalationSink, LogSink, MonitorEvent, UnreachableSink},
    CareCompassError, CareCompassResult,
};
use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// 終了時の再送結果を待つ上限
const RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Care Compass - 危機リスク監視とカウンセラーへのエスカレーション
#[derive(Debug, Parser)]
#[command(name = "care-compass", version, about)]
struct Cli {
    /// 設定ファイルのパス（省略時はXDG設定ディレクトリ）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// ログレベルを上書き (trace/debug/info/warn/error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// スコア(0-100)のリスクレベルを表示
    Classify { score: f64 },

    /// モニターを実時間で実行（Ctrl-Cで停止）
    Monitor(MonitorArgs),

    /// 設定ファイルの管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// 緊急連絡先を表示
    Contacts,
}

#[derive(Debug, Args)]
struct MonitorArgs {
    /// 固定スコア列（例: 10,50,85）。最後の値を繰り返す
    #[arg(long)]
    script: Option<String>,

    /// 合成ソースの乱数シード
    #[arg(long)]
    seed: Option<u64>,

    /// 指定秒数で自動停止
    #[arg(long)]
    duration_secs: Option<u64>,

    /// 危機状態に入ったら即座に解除する
    #[arg(long)]
    auto_dismiss: bool,

    /// 開始から指定秒後に「今すぐ接続」を実行
    #[arg(long)]
    connect_now_after_secs: Option<u64>,

    /// エスカレーションに添付する書き起こし
    #[arg(long)]
    transcript: Option<String>,

    /// サンプリング間隔(ms)を上書き
    #[arg(long)]
    interval_ms: Option<u64>,

    /// カウントダウン秒数を上書き
    #[arg(long)]
    countdown_secs: Option<u32>,

    /// 利用不可ソースで起動（許可拒否の再現）
    #[arg(long, conflicts_with_all = ["script", "seed"])]
    unavailable: bool,

    /// 配送できないシンクを使う（再送経路の確認）
    #[arg(long)]
    unreachable: bool,

    /// 終了時の記録をJSONで出力
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// 設定ファイルのパスを表示
    Path,
    /// 有効な設定をTOMLで表示
    Show,
    /// 既定値で設定ファイルを作成
    Init,
    /// 既存ファイルをバックアップして既定値に戻す
    Reset,
}

#[tokio::main]
async fn main() -> CareCompassResult<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    }
    .map_err(config_error)?;

    // ログ初期化前なのでエラーは保持して後で出力
    let (mut config, load_error) = match config_manager.load_config() {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    if let Some(level) = &cli.log_level {
        config.log.log_level = level.clone();
    }

    // tokio-consoleの初期化（プロファイリング用）
    #[cfg(feature = "debug-tokio")]
    console_subscriber::init();

    #[cfg(not(feature = "debug-tokio"))]
    let _log_guard = init_logging_or_default(&config.log)?;

    if let Some(e) = load_error {
        tracing::warn!("設定読み込みエラー、デフォルト設定を使用: {:#}", e);
    }

    match cli.command {
        Command::Classify { score } => {
            let score = EmotionScore::new(score)?;
            let level = config.monitor.thresholds.classify(score);
            println!("{} -> {}", score, level);
        }
        Command::Monitor(args) => run_monitor(config, args).await?,
        Command::Config { action } => {
            run_config(&config_manager, &config, action).map_err(config_error)?
        }
        Command::Contacts => {
            println!("Emergency contacts:");
            for contact in &config.emergency_contacts {
                println!("  {:<20} {}", contact.name, contact.number);
            }
        }
    }

    Ok(())
}

fn config_error(e: anyhow::Error) -> CareCompassError {
    CareCompassError::Config(format!("{:#}", e))
}

/// 設定のログ出力先が使えない場合はコンソールのみで続行
#[cfg(not(feature = "debug-tokio"))]
fn init_logging_or_default(
    log: &LogConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    match logging::init_logging(log) {
        Ok(guard) => Ok(guard),
        Err(e) if log.enable_file_logging => {
            eprintln!("⚠️ File logging unavailable ({:#}), console only", e);
            let console_only = LogConfig {
                enable_file_logging: false,
                ..log.clone()
            };
            logging::init_logging(&console_only)
        }
        Err(e) => Err(e),
    }
}

/// 指定秒数後に完了（未指定なら完了しない）
async fn sleep_for(secs: Option<u64>) {
    match secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_monitor(mut config: AppConfig, args: MonitorArgs) -> CareCompassResult<()> {
    if let Some(ms) = args.interval_ms {
        config.monitor.sample_interval_ms = ms;
    }
    if let Some(secs) = args.countdown_secs {
        config.monitor.countdown_secs = secs;
    }

    let source: Box<dyn EmotionSource> = if args.unavailable {
        Box::new(UnavailableSource)
    } else if let Some(script) = &args.script {
        Box::new(ScriptedSource::parse(script, ScriptEnd::RepeatLast)?)
    } else if let Some(seed) = args.seed {
        Box::new(SyntheticSource::seeded(seed))
    } else {
        Box::new(SyntheticSource::new())
    };

    let sink: Arc<dyn EscalationSink> = if args.unreachable {
        Arc::new(UnreachableSink)
    } else {
        Arc::new(LogSink)
    };

    let service = CrisisMonitorService::new(config.monitor.clone(), source, sink)?;
    let mut events = service.subscribe();

    let snapshot = service.start();
    service.set_transcript(args.transcript.clone());
    println!(
        "🧭 Monitoring started (phase: {}, interval: {}ms, countdown: {}s)",
        snapshot.phase, config.monitor.sample_interval_ms, config.monitor.countdown_secs
    );

    let deadline = sleep_for(args.duration_secs);
    tokio::pin!(deadline);

    let connect_now = sleep_for(args.connect_now_after_secs);
    tokio::pin!(connect_now);
    let mut connect_fired = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("🛑 終了シグナルを受信しました");
                break;
            }
            _ = &mut deadline => {
                tracing::info!("⏱️ Monitoring duration elapsed");
                break;
            }
            _ = &mut connect_now, if !connect_fired => {
                connect_fired = true;
                match service.escalate() {
                    Ok(event) => tracing::info!("📞 Connect-now requested: {}", event.id()),
                    Err(e) => tracing::warn!("Connect-now failed: {}", e),
                }
            }
            received = events.recv() => match received {
                Ok(event) => {
                    print_event(&event);
                    match &event {
                        MonitorEvent::Changed(MonitorChange::CrisisArmed { .. }) if args.auto_dismiss => {
                            if let Err(e) = service.dismiss() {
                                tracing::warn!("Auto-dismiss failed: {}", e);
                            }
                        }
                        MonitorEvent::Changed(MonitorChange::SourceUnavailable { .. }) => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("📡 Event display lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    service.stop();

    if !service.pending_escalations().is_empty() {
        let (delivered, failed) = retry_pending(&service, &mut events, RETRY_TIMEOUT).await;
        println!(
            "🔁 retried escalations: {} delivered, {} still undelivered",
            delivered, failed
        );
    }

    print_summary(&service, args.json)?;
    Ok(())
}

/// 配送待ちのエスカレーションを再送し、結果が出るまで待つ
///
/// 戻り値は（配送成功数, 再び失敗した数）。
async fn retry_pending(
    service: &CrisisMonitorService,
    events: &mut broadcast::Receiver<MonitorEvent>,
    timeout: Duration,
) -> (usize, usize) {
    let mut waiting: HashSet<CrisisEventId> = HashSet::new();
    for event_id in service.pending_escalations() {
        match service.retry_escalation(event_id) {
            Ok(()) => {
                waiting.insert(event_id);
            }
            Err(e) => tracing::warn!("🔁 Retry of {} not queued: {}", event_id, e),
        }
    }

    let mut delivered = 0;
    let mut failed = 0;
    let outcome = tokio::time::timeout(timeout, async {
        while !waiting.is_empty() {
            match events.recv().await {
                Ok(event) => {
                    print_event(&event);
                    match event {
                        MonitorEvent::EscalationDelivered { event_id, .. }
                            if waiting.remove(&event_id) =>
                        {
                            delivered += 1
                        }
                        MonitorEvent::EscalationFailed { event_id, .. }
                            if waiting.remove(&event_id) =>
                        {
                            failed += 1
                        }
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("📡 Retry results lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;

    if outcome.is_err() {
        tracing::warn!("⏱️ Gave up waiting for {} retried escalation(s)", waiting.len());
    }
    (delivered, failed)
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::Changed(change) => match change {
            MonitorChange::Started => println!("▶️  started"),
            MonitorChange::Stopped => println!("⏹️  stopped"),
            MonitorChange::Sampled { score, risk } => {
                println!("🎙️  score {:>4} -> {}", score, risk)
            }
            MonitorChange::RiskChanged { from, to } => println!("📈 risk {} -> {}", from, to),
            MonitorChange::CrisisArmed { countdown_secs } => {
                println!("🚨 crisis detected, connecting in {}s unless dismissed", countdown_secs)
            }
            MonitorChange::CountdownTick { remaining_secs } => {
                println!("⏳ {}s remaining", remaining_secs)
            }
            MonitorChange::Dismissed => println!("🙆 dismissed, monitoring continues"),
            MonitorChange::Escalated(crisis) => println!("📞 escalated: {}", crisis.summary()),
            MonitorChange::SourceUnavailable { reason } => {
                println!("🚫 sampling unavailable: {}", reason)
            }
        },
        MonitorEvent::EscalationDelivered { event_id, sink } => {
            println!("✅ escalation {} delivered via {}", event_id, sink)
        }
        MonitorEvent::EscalationFailed { event_id, reason } => {
            println!("❌ escalation {} failed: {} (retried on exit)", event_id, reason)
        }
    }
}

fn print_summary(service: &CrisisMonitorService, json: bool) -> anyhow::Result<()> {
    let snapshot = service.snapshot();
    let recent = service.recent_events();

    if json {
        let output = serde_json::json!({
            "snapshot": snapshot,
            "recent_events": recent,
            "pending_escalations": service.pending_escalations(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "📊 {} samples, {} crisis events recorded",
        snapshot.sample_count, snapshot.history_len
    );
    for event in &recent {
        println!("  - {}", event.summary());
    }
    let pending = service.pending_escalations();
    if !pending.is_empty() {
        println!("  {} escalation(s) awaiting retry", pending.len());
    }
    Ok(())
}

fn run_config(
    manager: &ConfigManager,
    config: &AppConfig,
    action: ConfigAction,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Path => println!("{}", manager.config_path().display()),
        ConfigAction::Show => {
            let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
            println!("{}", content);
        }
        ConfigAction::Init => {
            if manager.config_exists() {
                println!("Config already exists: {}", manager.config_path().display());
            } else {
                manager.save_config(&AppConfig::default())?;
                println!("Created {}", manager.config_path().display());
            }
        }
        ConfigAction::Reset => {
            if manager.config_exists() {
                let backup = manager.backup_config()?;
                println!("Backed up to {}", backup.display());
            }
            manager.reset_config()?;
            println!("Reset {}", manager.config_path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use care_compass::config::MonitorConfig;
    use care_compass::crisis::CrisisEvent;
    use care_compass::error::EscalationError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 最初の配送だけ失敗するシンク
    #[derive(Default)]
    struct FlakySink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EscalationSink for FlakySink {
        async fn notify(&self, _event: &CrisisEvent) -> Result<(), EscalationError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EscalationError::Unreachable("line busy".to_string()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn service_with(sink: Arc<dyn EscalationSink>) -> CrisisMonitorService {
        let source = ScriptedSource::from_values(&[10.0], ScriptEnd::RepeatLast);
        CrisisMonitorService::new(MonitorConfig::default(), Box::new(source), sink).unwrap()
    }

    /// 接続要求して最初の配送失敗を待つ
    async fn escalate_and_fail(
        service: &CrisisMonitorService,
        events: &mut broadcast::Receiver<MonitorEvent>,
    ) -> CrisisEventId {
        service.start();
        let id = service.escalate().unwrap().id();
        loop {
            if let MonitorEvent::EscalationFailed { event_id, .. } = events.recv().await.unwrap() {
                assert_eq!(event_id, id);
                return id;
            }
        }
    }

    #[tokio::test]
    async fn test_retry_on_exit_delivers_previously_failed_escalation() {
        let service = service_with(Arc::new(FlakySink::default()));
        let mut events = service.subscribe();
        let id = escalate_and_fail(&service, &mut events).await;
        assert_eq!(service.pending_escalations(), vec![id]);

        service.stop();
        let outcome = retry_pending(&service, &mut events, Duration::from_secs(5)).await;
        assert_eq!(outcome, (1, 0));
        assert!(service.pending_escalations().is_empty());
    }

    #[tokio::test]
    async fn test_retry_on_exit_keeps_still_failing_escalation() {
        let service = service_with(Arc::new(UnreachableSink));
        let mut events = service.subscribe();
        let id = escalate_and_fail(&service, &mut events).await;

        service.stop();
        let outcome = retry_pending(&service, &mut events, Duration::from_secs(5)).await;
        assert_eq!(outcome, (0, 1));
        assert_eq!(service.pending_escalations(), vec![id]);
    }

    #[tokio::test]
    async fn test_retry_with_nothing_pending_returns_immediately() {
        let service = service_with(Arc::new(LogSink));
        let mut events = service.subscribe();
        let outcome = retry_pending(&service, &mut events, Duration::from_secs(5)).await;
        assert_eq!(outcome, (0, 0));
    }

    #[test]
    fn test_config_errors_map_to_config_variant() {
        let err = config_error(anyhow::anyhow!("bad toml").context("Failed to parse config"));
        assert!(matches!(err, CareCompassError::Config(ref msg) if msg.contains("bad toml")));
    }
}
