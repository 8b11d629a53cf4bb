//! tokio上で状態機械を駆動するランタイム層

pub mod broadcaster;
pub mod escalation;
pub mod service;
pub mod timer_service;

pub use broadcaster::{MonitorBroadcaster, MonitorEvent, BROADCAST_CAPACITY};
pub use escalation::{
    EscalationDispatcher, EscalationSink, LogSink, UnreachableSink, COUNSELOR_NOTICE,
};
pub use service::CrisisMonitorService;
pub use timer_service::{TimerConfig, TimerResult, TimerService};
