pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod latency;
pub mod limiter;
pub mod pipeline;
pub mod selector;
pub mod stream;
pub mod telemetry;
pub mod token_estimate;
pub mod upstream_client;

pub use auth::{AuthContext, AuthError, AuthProvider, KeyedAuth, NoneAuth};
pub use config::{build_pipelines, ConfigError, PipelineConfigDoc};
pub use dispatcher::{DispatchBody, DispatchResponse, Dispatcher};
pub use endpoint::{AuthMaterial, EndpointDescriptor, EndpointKind};
pub use error::GatewayError;
pub use latency::LatencyTracker;
pub use pipeline::{Pipeline, PipelineResponse};
pub use selector::Selector;
pub use telemetry::{EventHubRecorder, MetricTags, TelemetryRecorder};
