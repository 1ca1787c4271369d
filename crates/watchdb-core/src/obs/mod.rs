//! Observability: runtime event counters routed through a metrics sink.
//!
//! Collections and the transaction engine never touch the counter state
//! directly; they emit [`MetricsEvent`]s through `sink::record`.

pub(crate) mod metrics;
pub(crate) mod sink;

pub use metrics::{CollectionCounters, CollectionSummary, EventOps, EventReport, EventState};
pub use sink::{MetricsEvent, MetricsSink, metrics_report, metrics_reset_all, with_metrics_sink};
