use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aicentral_common::{EndpointId, PartitionMode};
use serde::Deserialize;

use crate::auth::{AuthProvider, ClientEntry, KeyedAuth, NoneAuth};
use crate::dispatcher::Dispatcher;
use crate::endpoint::{AuthMaterial, EndpointDescriptor, EndpointKind};
use crate::latency::LatencyTracker;
use crate::limiter::bulkhead::BulkheadStep;
use crate::limiter::request_rate::RequestRateStep;
use crate::limiter::token_rate::TokenRateStep;
use crate::limiter::PipelineStep;
use crate::pipeline::Pipeline;
use crate::selector::{AffinityTable, Selector};
use crate::telemetry::TelemetryRecorder;
use crate::upstream_client::UpstreamClient;

/// Top-level declarative document: one entry per hostname-bound pipeline.
#[derive(Debug, Deserialize)]
pub struct PipelineConfigDoc {
    pub pipelines: Vec<PipelineSpec>,
}

#[derive(Debug, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub host: String,
    pub auth: AuthSpec,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default = "default_affinity_ttl_secs")]
    pub affinity_ttl_secs: u64,
    pub selector: SelectorSpec,
}

fn default_affinity_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthSpec {
    None,
    Keys { clients: Vec<ClientSpec> },
}

#[derive(Debug, Deserialize)]
pub struct ClientSpec {
    pub name: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    Bulkhead {
        capacity: usize,
        #[serde(default)]
        queue_timeout_secs: Option<u64>,
        #[serde(default = "default_partition_mode")]
        partition: PartitionMode,
    },
    RequestRate {
        requests: u32,
        window_secs: u64,
        #[serde(default = "default_partition_mode")]
        partition: PartitionMode,
    },
    TokenRate {
        tokens: u64,
        window_secs: u64,
        #[serde(default = "default_partition_mode")]
        partition: PartitionMode,
    },
}

fn default_partition_mode() -> PartitionMode {
    PartitionMode::PerPipeline
}

/// Declarative endpoint shape. Flatter than `EndpointDescriptor`/`AuthMaterial`
/// on the wire (a single `api_key` field rather than a tagged auth object) —
/// `build()` below does the translation.
#[derive(Debug, Deserialize)]
pub struct EndpointSpec {
    pub kind: EndpointKind,
    pub id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub api_key: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub model_map: HashMap<String, String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub api_version: Option<String>,
}

impl EndpointSpec {
    fn build(self) -> Result<EndpointDescriptor, ConfigError> {
        let base_url = match (&self.kind, self.base_url) {
            (_, Some(url)) => url,
            (EndpointKind::OpenAi, None) => "https://api.openai.com".to_string(),
            (EndpointKind::AzureOpenAi, None) => {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {}: azure_openai requires base_url",
                    self.id
                )));
            }
        };
        let auth = match self.kind {
            EndpointKind::AzureOpenAi => AuthMaterial::ApiKey {
                api_key: self.api_key,
            },
            EndpointKind::OpenAi => AuthMaterial::Bearer {
                api_key: self.api_key,
                organization: self.organization,
            },
        };
        Ok(EndpointDescriptor {
            id: EndpointId::from(self.id),
            kind: self.kind,
            base_url,
            auth,
            model_map: self.model_map,
            max_concurrency: self.max_concurrency,
            api_version: self.api_version.unwrap_or_else(|| "2024-06-01".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectorSpec {
    Random { endpoints: Vec<EndpointSpec> },
    Priority { tiers: Vec<Vec<EndpointSpec>> },
    LowestLatency { endpoints: Vec<EndpointSpec> },
    Hierarchical { children: Vec<SelectorSpec> },
    Affinity { inner: Box<SelectorSpec> },
}

impl SelectorSpec {
    /// Every endpoint id named anywhere in this subtree, for building one
    /// shared `LatencyTracker` per pipeline.
    fn endpoint_ids(&self, out: &mut Vec<EndpointId>) {
        match self {
            SelectorSpec::Random { endpoints } | SelectorSpec::LowestLatency { endpoints } => {
                out.extend(endpoints.iter().map(|e| EndpointId::from(e.id.as_str())));
            }
            SelectorSpec::Priority { tiers } => {
                for tier in tiers {
                    out.extend(tier.iter().map(|e| EndpointId::from(e.id.as_str())));
                }
            }
            SelectorSpec::Hierarchical { children } => {
                for child in children {
                    child.endpoint_ids(out);
                }
            }
            SelectorSpec::Affinity { inner } => inner.endpoint_ids(out),
        }
    }

    fn build(
        self,
        client: &Arc<dyn UpstreamClient>,
        latency: &Arc<LatencyTracker>,
        affinity_ttl: Duration,
    ) -> Result<Selector, ConfigError> {
        let dispatcher = |spec: EndpointSpec| -> Result<Arc<Dispatcher>, ConfigError> {
            let descriptor = spec.build()?;
            Ok(Arc::new(Dispatcher::new(descriptor, client.clone(), latency.clone())))
        };

        Ok(match self {
            SelectorSpec::Random { endpoints } => {
                let dispatchers = endpoints
                    .into_iter()
                    .map(dispatcher)
                    .collect::<Result<Vec<_>, _>>()?;
                Selector::Random(dispatchers)
            }
            SelectorSpec::LowestLatency { endpoints } => {
                let dispatchers = endpoints
                    .into_iter()
                    .map(dispatcher)
                    .collect::<Result<Vec<_>, _>>()?;
                Selector::LowestLatency(dispatchers)
            }
            SelectorSpec::Priority { tiers } => {
                let tiers = tiers
                    .into_iter()
                    .map(|tier| tier.into_iter().map(dispatcher).collect::<Result<Vec<_>, _>>())
                    .collect::<Result<Vec<_>, _>>()?;
                Selector::Priority(tiers)
            }
            SelectorSpec::Hierarchical { children } => {
                let children = children
                    .into_iter()
                    .map(|child| child.build(client, latency, affinity_ttl))
                    .collect::<Result<Vec<_>, _>>()?;
                Selector::Hierarchical(children)
            }
            SelectorSpec::Affinity { inner } => Selector::Affinity {
                inner: Box::new(inner.build(client, latency, affinity_ttl)?),
                table: AffinityTable::new(),
                ttl: affinity_ttl,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pipeline configuration: {0}")]
    Invalid(String),

    #[error("malformed configuration document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parses a `PipelineConfigDoc` and builds the immutable, hostname-indexed
/// set of pipelines it describes. Validates that no two pipelines share a
/// hostname and that every selector subtree names at least one endpoint.
pub fn build_pipelines(
    json: &[u8],
    client: Arc<dyn UpstreamClient>,
    telemetry: Arc<dyn TelemetryRecorder>,
) -> Result<HashMap<String, Arc<Pipeline>>, ConfigError> {
    let doc: PipelineConfigDoc = serde_json::from_slice(json)?;
    let mut pipelines = HashMap::new();

    for spec in doc.pipelines {
        if pipelines.contains_key(&spec.host) {
            return Err(ConfigError::Invalid(format!(
                "duplicate pipeline hostname: {}",
                spec.host
            )));
        }

        let mut endpoint_ids = Vec::new();
        spec.selector.endpoint_ids(&mut endpoint_ids);
        if endpoint_ids.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "pipeline {}: selector names no endpoints",
                spec.name
            )));
        }

        let latency = Arc::new(LatencyTracker::new(endpoint_ids));
        let affinity_ttl = Duration::from_secs(spec.affinity_ttl_secs);
        let selector = spec.selector.build(&client, &latency, affinity_ttl)?;

        let auth: Arc<dyn AuthProvider> = match spec.auth {
            AuthSpec::None => Arc::new(NoneAuth),
            AuthSpec::Keys { clients } => Arc::new(KeyedAuth::new(
                clients
                    .into_iter()
                    .map(|c| ClientEntry {
                        name: c.name,
                        allowed_keys: c.keys,
                    })
                    .collect(),
            )),
        };

        let steps: Vec<Arc<dyn PipelineStep>> = spec
            .steps
            .into_iter()
            .map(|step| build_step(step))
            .collect();

        let pipeline = Pipeline::new(spec.name, auth, steps, selector, telemetry.clone());
        pipelines.insert(spec.host, Arc::new(pipeline));
    }

    Ok(pipelines)
}

fn build_step(spec: StepSpec) -> Arc<dyn PipelineStep> {
    match spec {
        StepSpec::Bulkhead {
            capacity,
            queue_timeout_secs,
            partition,
        } => Arc::new(BulkheadStep::new(
            capacity,
            queue_timeout_secs.map(Duration::from_secs),
            partition,
        )),
        StepSpec::RequestRate {
            requests,
            window_secs,
            partition,
        } => Arc::new(RequestRateStep::new(
            requests,
            Duration::from_secs(window_secs),
            partition,
        )),
        StepSpec::TokenRate {
            tokens,
            window_secs,
            partition,
        } => Arc::new(TokenRateStep::new(
            tokens,
            Duration::from_secs(window_secs),
            partition,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::EventHubRecorder;
    use crate::upstream_client::{UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse};
    use std::future::Future;
    use std::pin::Pin;

    struct NoopClient;

    impl UpstreamClient for NoopClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
        {
            Box::pin(async move {
                Err(UpstreamFailure::Transport {
                    kind: crate::upstream_client::UpstreamTransportErrorKind::Other,
                    message: "noop".to_string(),
                })
            })
        }
    }

    const DOC: &str = r#"{
        "pipelines": [
            {
                "name": "prod",
                "host": "prod.gateway.example.com",
                "auth": { "kind": "keys", "clients": [{ "name": "team-a", "keys": ["sk-a"] }] },
                "steps": [
                    { "kind": "bulkhead", "capacity": 32 },
                    { "kind": "token_rate", "tokens": 200000, "window_secs": 60, "partition": "per_pipeline" }
                ],
                "affinity_ttl_secs": 60,
                "selector": {
                    "kind": "priority",
                    "tiers": [
                        [{ "kind": "azure_openai", "id": "azure-east", "base_url": "https://east.openai.azure.com", "api_key": "k1", "model_map": {"gpt-4": "gpt4-prod"} }],
                        [{ "kind": "openai", "id": "openai-fallback", "api_key": "k2", "model_map": {"gpt-4": "gpt-4"} }]
                    ]
                }
            }
        ]
    }"#;

    #[test]
    fn builds_one_pipeline_per_hostname() {
        let client: Arc<dyn UpstreamClient> = Arc::new(NoopClient);
        let telemetry: Arc<dyn TelemetryRecorder> = Arc::new(EventHubRecorder::new(16));
        let pipelines = build_pipelines(DOC.as_bytes(), client, telemetry).unwrap();
        assert_eq!(pipelines.len(), 1);
        let pipeline = pipelines.get("prod.gateway.example.com").unwrap();
        assert_eq!(pipeline.name, "prod");
    }

    #[test]
    fn rejects_selector_with_no_endpoints() {
        let bad = r#"{
            "pipelines": [{
                "name": "empty",
                "host": "empty.example.com",
                "auth": { "kind": "none" },
                "selector": { "kind": "random", "endpoints": [] }
            }]
        }"#;
        let client: Arc<dyn UpstreamClient> = Arc::new(NoopClient);
        let telemetry: Arc<dyn TelemetryRecorder> = Arc::new(EventHubRecorder::new(16));
        let err = build_pipelines(bad.as_bytes(), client, telemetry).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
