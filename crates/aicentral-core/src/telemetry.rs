use aicentral_common::{CallKind, EndpointId};
use tokio::sync::broadcast;

/// Dimensions attached to one metric emission. `None` fields are simply
/// omitted from the tag set — not every metric carries every dimension.
#[derive(Debug, Clone, Default)]
pub struct MetricTags {
    pub pipeline: String,
    pub endpoint: Option<EndpointId>,
    pub deployment: Option<String>,
    pub model: Option<String>,
    pub call_kind: Option<CallKind>,
    pub streaming: Option<bool>,
    pub success: Option<bool>,
    pub client_name: Option<String>,
}

/// One emitted metric, broadcast to any subscriber (tests, a future real
/// sink) in addition to being logged.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    Histogram {
        name: &'static str,
        value: f64,
        tags: MetricTags,
    },
    UpDownCounter {
        name: &'static str,
        delta: i64,
        tags: MetricTags,
    },
    Gauge { name: String, value: f64 },
}

/// Abstract telemetry sink. The concrete backend (Prometheus, OTLP, a
/// no-op) is an external collaborator; the pipeline only ever talks to
/// this trait.
#[async_trait::async_trait]
pub trait TelemetryRecorder: Send + Sync {
    async fn histogram(&self, name: &'static str, value: f64, tags: MetricTags);
    async fn up_down_counter(&self, name: &'static str, delta: i64, tags: MetricTags);
    /// Gauges that cannot carry dimensions are addressed by a synthetic
    /// metric name instead: `downstream.{host}.{modelOrDeployment}.{metric}`.
    async fn gauge(&self, host: &str, model_or_deployment: &str, metric: &str, value: f64);
}

/// Default recorder: logs every emission via `tracing` and rebroadcasts it
/// on an in-process channel so tests and future sinks can subscribe via
/// [`EventHubRecorder::subscribe`].
pub struct EventHubRecorder {
    tx: broadcast::Sender<MetricEvent>,
}

impl EventHubRecorder {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: MetricEvent) {
        let _ = self.tx.send(event);
    }
}

#[async_trait::async_trait]
impl TelemetryRecorder for EventHubRecorder {
    async fn histogram(&self, name: &'static str, value: f64, tags: MetricTags) {
        tracing::debug!(
            event = "telemetry_histogram",
            metric = name,
            value,
            pipeline = %tags.pipeline,
            endpoint = tags.endpoint.as_ref().map(EndpointId::as_str),
            call_kind = tags.call_kind.as_ref().map(CallKind::as_str),
        );
        self.emit(MetricEvent::Histogram { name, value, tags });
    }

    async fn up_down_counter(&self, name: &'static str, delta: i64, tags: MetricTags) {
        tracing::debug!(
            event = "telemetry_counter",
            metric = name,
            delta,
            pipeline = %tags.pipeline,
        );
        self.emit(MetricEvent::UpDownCounter { name, delta, tags });
    }

    async fn gauge(&self, host: &str, model_or_deployment: &str, metric: &str, value: f64) {
        let name = gauge_metric_name(host, model_or_deployment, metric);
        tracing::debug!(event = "telemetry_gauge", metric = %name, value);
        self.emit(MetricEvent::Gauge { name, value });
    }
}

/// Gauges can't carry per-request dimensions, so the dimension is folded
/// into the metric name instead: `downstream.{host_normalized}.{model}.{metric}`.
pub fn gauge_metric_name(host: &str, model_or_deployment: &str, metric: &str) -> String {
    format!(
        "downstream.{}.{}.{}",
        normalize_segment(host),
        normalize_segment(model_or_deployment),
        metric
    )
}

fn normalize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
