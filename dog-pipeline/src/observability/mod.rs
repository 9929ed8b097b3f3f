pub mod metrics;

#[cfg(feature = "tracing-basic")]
pub mod tracing;

pub use metrics::{ActiveGuard, MetricsSnapshot, PipelineMetrics, QueueGauge, QueueGaugeSnapshot};

#[cfg(feature = "tracing-basic")]
pub use self::tracing::{init_tracing, LogFormat};
