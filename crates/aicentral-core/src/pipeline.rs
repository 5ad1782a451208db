use std::sync::Arc;
use std::time::Instant;

use aicentral_protocol::classify_request;
use bytes::Bytes;
use http::{HeaderMap, Method};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::dispatcher::DispatchBody;
use crate::error::GatewayError;
use crate::limiter::{PipelineStep, StepToken};
use crate::selector::Selector;
use crate::telemetry::{MetricTags, TelemetryRecorder};

/// What a pipeline hands back to the HTTP host: status, headers, and a
/// body that is either fully buffered or a live stream plus a token
/// estimate that resolves once the upstream finishes.
pub struct PipelineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: DispatchBody,
}

/// Ordered chain of cross-cutting steps terminated by an endpoint selector,
/// bound to one hostname. Owns everything a request needs end to end:
/// auth, admission, routing, dispatch, and the telemetry emitted on every
/// exit path.
pub struct Pipeline {
    pub name: String,
    auth: Arc<dyn AuthProvider>,
    steps: Vec<Arc<dyn PipelineStep>>,
    selector: Selector,
    telemetry: Arc<dyn TelemetryRecorder>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        steps: Vec<Arc<dyn PipelineStep>>,
        selector: Selector,
        telemetry: Arc<dyn TelemetryRecorder>,
    ) -> Self {
        Self {
            name: name.into(),
            auth,
            steps,
            selector,
            telemetry,
        }
    }

    pub async fn handle(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> PipelineResponse {
        let trace_id = Uuid::new_v4().to_string();
        let started_at = Instant::now();

        self.telemetry
            .up_down_counter("active_requests", 1, MetricTags {
                pipeline: self.name.clone(),
                ..Default::default()
            })
            .await;
        let response = self.handle_inner(&trace_id, method, path, &headers, body).await;
        self.telemetry
            .up_down_counter("active_requests", -1, MetricTags {
                pipeline: self.name.clone(),
                ..Default::default()
            })
            .await;

        info!(
            event = "request_completed",
            pipeline = %self.name,
            trace_id = %trace_id,
            status = response.status,
            elapsed_ms = started_at.elapsed().as_millis(),
        );
        response
    }

    async fn handle_inner(
        &self,
        trace_id: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> PipelineResponse {
        let mut details = match classify_request(&method, path, headers, body) {
            Ok(details) => details,
            Err(err) => return error_response(GatewayError::from(err)),
        };

        let auth_ctx = match self.auth.authenticate(headers) {
            Ok(ctx) => ctx,
            Err(err) => {
                return PipelineResponse {
                    status: err.status,
                    headers: Vec::new(),
                    body: DispatchBody::Buffered(Bytes::from(err.body)),
                };
            }
        };
        details.consumer_id = auth_ctx.consumer_id.as_ref().map(|id| id.as_str().to_string());

        info!(
            event = "request_received",
            pipeline = %self.name,
            trace_id = %trace_id,
            call_kind = %details.call_kind,
            consumer = ?details.consumer_id,
            streaming = details.response_shape.is_streaming(),
        );

        let mut admitted: Vec<(Arc<dyn PipelineStep>, StepToken)> = Vec::new();
        for step in &self.steps {
            match step.pre(&details).await {
                Ok(token) => admitted.push((step.clone(), token)),
                Err(err) => {
                    warn!(
                        event = "request_rejected",
                        pipeline = %self.name,
                        trace_id = %trace_id,
                        step = step.name(),
                        status = err.status(),
                    );
                    for (step, token) in admitted.into_iter().rev() {
                        step.post(&details, token, None).await;
                    }
                    return error_response(err);
                }
            }
        }

        let (usage, dispatch_response) = self.selector.execute(&details).await;

        let mut response_headers = dispatch_response.headers;
        response_headers.push(("x-aicentral-pipeline".to_string(), self.name.clone()));
        let status = dispatch_response.status;

        match dispatch_response.body {
            DispatchBody::Buffered(bytes) => {
                for (step, token) in admitted.into_iter().rev() {
                    step.post(&details, token, Some(&usage)).await;
                }
                record_usage(&self.name, &self.telemetry, &usage).await;
                PipelineResponse {
                    status,
                    headers: response_headers,
                    body: DispatchBody::Buffered(bytes),
                }
            }
            DispatchBody::Streaming { chunks, tokens_done } => {
                // The trailer value and the token-rate reconciliation both
                // need the same final estimate, but a oneshot has exactly
                // one receiver — relay it through a fresh channel so the
                // reconciliation task and the HTTP host each get their own.
                let (relay_tx, relay_rx) = tokio::sync::oneshot::channel();
                let name = self.name.clone();
                let telemetry = self.telemetry.clone();
                let details = details.clone();
                tokio::spawn(async move {
                    let estimated_completion = tokens_done.await.unwrap_or(0);
                    let _ = relay_tx.send(estimated_completion);
                    let mut usage = usage;
                    usage.estimated_completion_tokens = Some(estimated_completion);
                    for (step, token) in admitted.into_iter().rev() {
                        step.post(&details, token, Some(&usage)).await;
                    }
                    record_usage(&name, &telemetry, &usage).await;
                });
                PipelineResponse {
                    status,
                    headers: response_headers,
                    body: DispatchBody::Streaming { chunks, tokens_done: relay_rx },
                }
            }
        }
    }
}

async fn record_usage(
    pipeline_name: &str,
    telemetry: &Arc<dyn TelemetryRecorder>,
    usage: &aicentral_protocol::UsageInformation,
) {
    telemetry
        .histogram(
            "upstream_duration_ms",
            usage.upstream_duration.as_secs_f64() * 1000.0,
            MetricTags {
                pipeline: pipeline_name.to_string(),
                endpoint: Some(usage.endpoint_id.clone()),
                deployment: Some(usage.deployment_or_model.clone()),
                call_kind: Some(usage.call_kind),
                streaming: Some(usage.streaming),
                success: Some(usage.success),
                ..Default::default()
            },
        )
        .await;
    if let Some(total) = usage.effective_completion_tokens() {
        telemetry
            .gauge(&usage.upstream_host, &usage.deployment_or_model, "completion_tokens", total as f64)
            .await;
    }
}

fn error_response(err: GatewayError) -> PipelineResponse {
    let mut headers = Vec::new();
    if let Some(retry_after) = err.retry_after() {
        headers.push(("Retry-After".to_string(), retry_after.as_secs().to_string()));
    }
    PipelineResponse {
        status: err.status(),
        headers,
        body: DispatchBody::Buffered(Bytes::from(
            serde_json::to_vec(&err.body()).unwrap_or_default(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoneAuth;
    use crate::dispatcher::Dispatcher;
    use crate::endpoint::{AuthMaterial, EndpointDescriptor, EndpointKind};
    use crate::latency::LatencyTracker;
    use crate::limiter::bulkhead::BulkheadStep;
    use crate::telemetry::EventHubRecorder;
    use crate::upstream_client::{
        UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    };
    use aicentral_common::{EndpointId, PartitionMode};
    use http::Method;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;

    struct FixedStatusClient(u16);

    impl UpstreamClient for FixedStatusClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
        {
            let status = self.0;
            Box::pin(async move {
                Ok(UpstreamHttpResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(
                        br#"{"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
                    )),
                })
            })
        }
    }

    fn single_endpoint_pipeline(name: &str, steps: Vec<Arc<dyn PipelineStep>>) -> Pipeline {
        let descriptor = EndpointDescriptor {
            id: EndpointId::from("only"),
            kind: EndpointKind::OpenAi,
            base_url: "https://api.openai.com".to_string(),
            auth: AuthMaterial::Bearer {
                api_key: "sk-test".to_string(),
                organization: None,
            },
            model_map: HashMap::from([("gpt-4".to_string(), "gpt-4".to_string())]),
            max_concurrency: None,
            api_version: "2024-06-01".to_string(),
        };
        let latency = Arc::new(LatencyTracker::new([EndpointId::from("only")]));
        let dispatcher = Arc::new(Dispatcher::new(
            descriptor,
            Arc::new(FixedStatusClient(200)),
            latency,
        ));
        Pipeline::new(
            name,
            Arc::new(NoneAuth),
            steps,
            Selector::Random(vec![dispatcher]),
            Arc::new(EventHubRecorder::new(16)),
        )
    }

    #[tokio::test]
    async fn buffered_request_flows_end_to_end() {
        let pipeline = single_endpoint_pipeline("prod", Vec::new());
        let body = Bytes::from(r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#);
        let response = pipeline
            .handle(Method::POST, "/v1/chat/completions", HeaderMap::new(), body)
            .await;

        assert_eq!(response.status, 200);
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k == "x-aicentral-pipeline" && v == "prod"));
        match response.body {
            DispatchBody::Buffered(bytes) => assert!(bytes.len() > 0),
            DispatchBody::Streaming { .. } => panic!("expected a buffered response"),
        }
    }

    #[tokio::test]
    async fn bulkhead_rejection_short_circuits_before_dispatch() {
        let bulkhead: Arc<dyn PipelineStep> =
            Arc::new(BulkheadStep::new(0, None, PartitionMode::PerPipeline));
        let pipeline = single_endpoint_pipeline("prod", vec![bulkhead]);
        let body = Bytes::from(r#"{"model":"gpt-4","messages":[]}"#);
        let response = pipeline
            .handle(Method::POST, "/v1/chat/completions", HeaderMap::new(), body)
            .await;

        assert_eq!(response.status, 429);
    }
}
