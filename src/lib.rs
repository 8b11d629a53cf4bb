pub mod config;
pub mod crisis;
pub mod error;
pub mod logging;
pub mod runtime;

// Re-export the main error types for convenience
pub use error::{CareCompassError, CareCompassResult, EscalationError, MonitorError, SourceError};

// Re-export the state machine and its vocabulary
pub use crisis::{
    classify, CrisisEvent, CrisisEventId, CrisisMonitor, EmotionScore, MonitorPhase,
    MonitorSnapshot, RiskLevel, RiskThresholds,
};

// Re-export the tokio runtime wiring
pub use runtime::{CrisisMonitorService, MonitorEvent};

pub use config::{AppConfig, ConfigManager, MonitorConfig};
