//! 危機モニターサービスの統合テスト
//!
//! tokioの時間を停止した状態で実行し、サンプリング・カウントダウン・
//! エスカレーション配送が実タイマー上で正しく連動することを確認する。

use async_trait::async_trait;
use care_compass::config::MonitorConfig;
use care_compass::crisis::{
    CrisisEvent, EmotionSource, MonitorChange, MonitorPhase, RiskLevel, ScriptEnd, ScriptedSource,
    TimerKind, UnavailableSource,
};
use care_compass::error::{EscalationError, MonitorError, SourceError};
use care_compass::runtime::{CrisisMonitorService, EscalationSink, LogSink, MonitorEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// 1秒間隔・3秒カウントダウンの短縮設定
fn fast_config() -> MonitorConfig {
    MonitorConfig {
        sample_interval_ms: 1000,
        countdown_secs: 3,
        countdown_tick_ms: 1000,
        ..MonitorConfig::default()
    }
}

fn scripted(values: &[f64]) -> Box<dyn EmotionSource> {
    Box::new(ScriptedSource::from_values(values, ScriptEnd::RepeatLast))
}

fn service_with(values: &[f64]) -> CrisisMonitorService {
    CrisisMonitorService::new(fast_config(), scripted(values), Arc::new(LogSink))
        .expect("valid config")
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// 受信済みのイベントをすべて取り出す
fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn sampled_risks(events: &[MonitorEvent]) -> Vec<RiskLevel> {
    events
        .iter()
        .filter_map(|event| match event {
            MonitorEvent::Changed(MonitorChange::Sampled { risk, .. }) => Some(*risk),
            _ => None,
        })
        .collect()
}

fn escalated_count(events: &[MonitorEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, MonitorEvent::Changed(MonitorChange::Escalated(_))))
        .count()
}

/// 到達可否を切り替えられるシンク
#[derive(Default)]
struct SwitchableSink {
    reachable: AtomicBool,
}

#[async_trait]
impl EscalationSink for SwitchableSink {
    async fn notify(&self, _event: &CrisisEvent) -> Result<(), EscalationError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EscalationError::Unreachable("counselor line busy".to_string()))
        }
    }

    fn name(&self) -> &'static str {
        "switchable"
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop_releases_all_timers() {
        let service = service_with(&[10.0]);
        assert_eq!(service.active_timer_count(), 0);

        let snapshot = service.start();
        assert_eq!(snapshot.phase, MonitorPhase::Monitoring);
        assert_eq!(service.active_timer_count(), 1);

        advance(2500).await;
        assert_eq!(service.snapshot().sample_count, 2);

        service.stop();
        assert_eq!(service.active_timer_count(), 0);
        assert_eq!(service.snapshot().phase, MonitorPhase::Idle);

        // 2回目の停止は何もしない
        service.stop();
        assert_eq!(service.active_timer_count(), 0);

        // 停止後はサンプリングが進まない
        let count = service.snapshot().sample_count;
        advance(5000).await;
        assert_eq!(service.snapshot().sample_count, count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_crisis_releases_countdown() {
        let service = service_with(&[90.0]);
        service.start();
        advance(1500).await;
        assert_eq!(service.snapshot().phase, MonitorPhase::CrisisPending);
        assert_eq!(service.active_timer_count(), 2);

        service.stop();
        assert_eq!(service.active_timer_count(), 0);

        advance(10_000).await;
        assert!(service.recent_events().is_empty());
    }
}

#[cfg(test)]
mod escalation_flow_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scenario_arms_countdown_only_on_third_sample() {
        let service = service_with(&[10.0, 50.0, 85.0]);
        let mut rx = service.subscribe();
        service.start();

        advance(2500).await;
        let events = drain(&mut rx);
        assert_eq!(sampled_risks(&events), vec![RiskLevel::Safe, RiskLevel::Medium]);
        assert_eq!(service.snapshot().phase, MonitorPhase::Monitoring);

        advance(1000).await;
        let events = drain(&mut rx);
        assert_eq!(sampled_risks(&events), vec![RiskLevel::Critical]);
        assert!(events.contains(&MonitorEvent::Changed(MonitorChange::CrisisArmed {
            countdown_secs: 3
        })));

        let snapshot = service.snapshot();
        assert_eq!(snapshot.phase, MonitorPhase::CrisisPending);
        assert_eq!(snapshot.session.countdown_seconds, 3);
        assert_eq!(service.active_timer_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_expiry_escalates_exactly_once() {
        // 危機検知後にスコアが下がってもカウントダウンは継続する
        let service = service_with(&[85.0, 10.0]);
        let mut rx = service.subscribe();
        service.start();

        advance(1500).await;
        assert_eq!(service.snapshot().phase, MonitorPhase::CrisisPending);

        advance(3000).await;
        let snapshot = service.snapshot();
        assert_eq!(snapshot.phase, MonitorPhase::Monitoring);
        assert_eq!(snapshot.session.countdown_seconds, 3);
        assert_eq!(service.active_timer_count(), 1);

        advance(10_000).await;
        let events = drain(&mut rx);
        assert_eq!(escalated_count(&events), 1);

        let remaining: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                MonitorEvent::Changed(MonitorChange::CountdownTick { remaining_secs }) => {
                    Some(*remaining_secs)
                }
                _ => None,
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let recent = service.recent_events();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].is_escalated());
        assert!(events.iter().any(|event| matches!(
            event,
            MonitorEvent::EscalationDelivered { event_id, sink: "log" } if *event_id == recent[0].id()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_cancels_countdown_without_event() {
        let service = service_with(&[85.0, 10.0]);
        service.start();
        advance(1500).await;
        assert_eq!(service.snapshot().phase, MonitorPhase::CrisisPending);

        tokio_test::assert_ok!(service.dismiss());
        let snapshot = service.snapshot();
        assert_eq!(snapshot.phase, MonitorPhase::Monitoring);
        assert_eq!(snapshot.session.countdown_seconds, 3);
        assert_eq!(service.active_timer_count(), 1);

        advance(10_000).await;
        assert!(service.recent_events().is_empty());
        assert_eq!(service.snapshot().phase, MonitorPhase::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_high_risk_rearms_after_dismiss() {
        let service = service_with(&[85.0]);
        service.start();
        advance(1500).await;
        service.dismiss().unwrap();
        assert_eq!(service.snapshot().phase, MonitorPhase::Monitoring);

        advance(1000).await;
        let snapshot = service.snapshot();
        assert_eq!(snapshot.phase, MonitorPhase::CrisisPending);
        assert_eq!(snapshot.session.countdown_seconds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worsening_risk_restarts_pending_countdown() {
        let config = MonitorConfig {
            sample_interval_ms: 2500,
            ..fast_config()
        };
        let service = CrisisMonitorService::new(config, scripted(&[70.0, 90.0]), Arc::new(LogSink))
            .unwrap();
        let mut rx = service.subscribe();
        service.start();

        // 2.5秒でhigh、2回ティックして残り1秒
        advance(4700).await;
        assert_eq!(service.snapshot().session.countdown_seconds, 1);

        // 5.0秒でcriticalになり初期値からやり直す
        advance(500).await;
        let snapshot = service.snapshot();
        assert_eq!(snapshot.phase, MonitorPhase::CrisisPending);
        assert_eq!(snapshot.session.current_risk_level, RiskLevel::Critical);
        assert_eq!(snapshot.session.countdown_seconds, 3);
        let mut timers = service.active_timers();
        timers.sort_by_key(|kind| *kind as u8);
        assert_eq!(timers, vec![TimerKind::Sampling, TimerKind::Countdown]);
        assert!(service.recent_events().is_empty());

        // criticalのままの7.5秒では再起動せず、8.0秒で満了
        advance(3000).await;
        let events = drain(&mut rx);
        let armed = events
            .iter()
            .filter(|event| matches!(event, MonitorEvent::Changed(MonitorChange::CrisisArmed { .. })))
            .count();
        assert_eq!(armed, 2);
        assert_eq!(escalated_count(&events), 1);

        let recent = service.recent_events();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].risk_level(), RiskLevel::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_outside_crisis_is_rejected() {
        let service = service_with(&[10.0]);
        tokio_test::assert_err!(service.dismiss());

        service.start();
        let err = service.dismiss().unwrap_err();
        assert!(matches!(
            err,
            MonitorError::InvalidTransition {
                operation: "dismiss",
                phase: MonitorPhase::Monitoring
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_escalation_carries_transcript() {
        let service = service_with(&[10.0]);
        service.start();
        service.set_transcript(Some("I can't do this anymore".to_string()));

        let event = service.escalate().unwrap();
        assert_eq!(event.transcript(), Some("I can't do this anymore"));
        assert_eq!(service.recent_events()[0].id(), event.id());
        assert_eq!(service.snapshot().phase, MonitorPhase::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_keeps_newest_events_only() {
        let config = MonitorConfig {
            history_capacity: 2,
            ..fast_config()
        };
        let service =
            CrisisMonitorService::new(config, scripted(&[10.0]), Arc::new(LogSink)).unwrap();
        service.start();

        let ids: Vec<_> = (0..3).map(|_| service.escalate().unwrap().id()).collect();

        let recent: Vec<_> = service.recent_events().iter().map(|e| e.id()).collect();
        assert_eq!(recent, vec![ids[2], ids[1]]);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_source_failure_moves_to_unavailable() {
        let service = CrisisMonitorService::new(
            fast_config(),
            Box::new(UnavailableSource),
            Arc::new(LogSink),
        )
        .unwrap();
        let mut rx = service.subscribe();
        service.start();

        advance(1500).await;
        let snapshot = service.snapshot();
        assert_eq!(snapshot.phase, MonitorPhase::Unavailable);
        assert!(snapshot.unavailable_reason.is_some());
        assert!(!snapshot.session.is_monitoring);
        assert_eq!(service.active_timer_count(), 0);
        assert!(drain(&mut rx).contains(&MonitorEvent::Changed(
            MonitorChange::SourceUnavailable {
                reason: SourceError::PermissionDenied
            }
        )));

        // 許可取得後の再開
        service.replace_source(scripted(&[20.0]));
        service.start();
        advance(1500).await;
        let snapshot = service.snapshot();
        assert_eq!(snapshot.phase, MonitorPhase::Monitoring);
        assert_eq!(snapshot.session.current_risk_level, RiskLevel::Safe);
        assert!(snapshot.unavailable_reason.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_kept_for_retry() {
        let sink = Arc::new(SwitchableSink::default());
        let service =
            CrisisMonitorService::new(fast_config(), scripted(&[10.0]), sink.clone()).unwrap();
        let mut rx = service.subscribe();
        service.start();

        let event = service.escalate().unwrap();
        advance(10).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::EscalationFailed { event_id, .. } if *event_id == event.id()
        )));
        assert_eq!(service.pending_escalations(), vec![event.id()]);
        // 配送に失敗しても記録は残る
        assert_eq!(service.recent_events().len(), 1);

        sink.reachable.store(true, Ordering::SeqCst);
        service.retry_escalation(event.id()).unwrap();
        advance(10).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::EscalationDelivered { event_id, sink: "switchable" } if *event_id == event.id()
        )));
        assert!(service.pending_escalations().is_empty());
        assert_eq!(
            service.retry_escalation(event.id()),
            Err(EscalationError::UnknownEvent(event.id()))
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = MonitorConfig {
            sample_interval_ms: 0,
            ..MonitorConfig::default()
        };
        let result = CrisisMonitorService::new(config, scripted(&[10.0]), Arc::new(LogSink));
        assert!(matches!(result, Err(MonitorError::InvalidConfig(_))));
    }
}
