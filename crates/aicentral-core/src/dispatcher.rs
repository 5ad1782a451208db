use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use aicentral_common::EndpointId;
use aicentral_protocol::{CallDetails, UsageInformation};
use bytes::Bytes;
use tokio::sync::{oneshot, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

use crate::endpoint::{AuthMaterial, EndpointDescriptor, EndpointKind};
use crate::latency::LatencyTracker;
use crate::stream::spawn_streaming_tee;
use crate::upstream_client::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamTransportErrorKind,
};

pub enum DispatchBody {
    Buffered(Bytes),
    Streaming {
        chunks: ReceiverStream<Result<Bytes, std::io::Error>>,
        tokens_done: oneshot::Receiver<u64>,
    },
}

pub struct DispatchResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: DispatchBody,
}

/// Executes one upstream HTTP call for a single configured endpoint: model
/// resolution, URL/auth construction, dispatch, and response interpretation
/// (exact usage when buffered, a streaming tee when not).
pub struct Dispatcher {
    pub descriptor: EndpointDescriptor,
    client: Arc<dyn UpstreamClient>,
    latency: Arc<LatencyTracker>,
    concurrency: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(
        descriptor: EndpointDescriptor,
        client: Arc<dyn UpstreamClient>,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        let concurrency = descriptor.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            descriptor,
            client,
            latency,
            concurrency,
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.descriptor.id
    }

    /// The latency tracker's current EWMA sample for this endpoint, or
    /// `None` if it has never completed a successful call yet.
    pub fn sampled_latency(&self) -> Option<Duration> {
        self.latency.sample(&self.descriptor.id)
    }

    pub async fn dispatch(&self, details: &CallDetails) -> (UsageInformation, DispatchResponse) {
        let started_at = SystemTime::now();
        let lookup_key = details.model_lookup_key().map(str::to_string);
        let upstream_model = lookup_key
            .as_deref()
            .and_then(|key| self.descriptor.resolve_upstream_model(key))
            .map(str::to_string);

        let Some(upstream_model) = upstream_model else {
            return (
                self.usage(details, false, Duration::ZERO, started_at, None),
                DispatchResponse {
                    status: 404,
                    headers: Vec::new(),
                    body: DispatchBody::Buffered(error_body("model not mapped for this endpoint")),
                },
            );
        };

        let url = self.build_url(&upstream_model, &details.remaining_path);
        let body = rewrite_model_field(&details.raw_body, &upstream_model);
        let headers = self.auth_headers();
        let method = if body.is_empty() {
            HttpMethod::Get
        } else {
            HttpMethod::Post
        };

        let request = UpstreamHttpRequest {
            method,
            url,
            headers,
            body: (!body.is_empty()).then_some(body),
            is_stream: details.response_shape.is_streaming(),
        };

        // An endpoint-level concurrency cap, when configured, queues dispatch
        // rather than rejecting it; the permit is held for buffered calls
        // until this function returns and handed into the streaming tee
        // task for the lifetime of a streamed response.
        let permit = match &self.concurrency {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("endpoint semaphore is never closed"),
            ),
            None => None,
        };

        let started = Instant::now();
        match self.client.send(request).await {
            Err(failure) => (
                self.usage(details, false, started.elapsed(), started_at, None),
                DispatchResponse {
                    status: upstream_failure_status(&failure),
                    headers: Vec::new(),
                    body: DispatchBody::Buffered(error_body(&failure.to_string())),
                },
            ),
            Ok(resp) => {
                let elapsed = started.elapsed();
                let success = (200..300).contains(&resp.status);
                if success {
                    self.latency.record(&self.descriptor.id, elapsed);
                }
                let rate_limit_hints = parse_rate_limit_hints(&resp.headers);

                match resp.body {
                    UpstreamBody::Bytes(bytes) => {
                        let exact_usage = success.then(|| parse_exact_usage(&bytes)).flatten();
                        let usage = self.usage(details, success, elapsed, started_at, exact_usage);
                        let usage = apply_rate_limit_hints(usage, rate_limit_hints);
                        (
                            usage,
                            DispatchResponse {
                                status: resp.status,
                                headers: resp.headers,
                                body: DispatchBody::Buffered(bytes),
                            },
                        )
                    }
                    UpstreamBody::Stream(rx) => {
                        let (chunks, tokens_done) =
                            spawn_streaming_tee(ReceiverStream::new(rx), permit);
                        let usage = self.usage(details, success, elapsed, started_at, None);
                        let usage = apply_rate_limit_hints(usage, rate_limit_hints);
                        (
                            usage,
                            DispatchResponse {
                                status: resp.status,
                                headers: resp.headers,
                                body: DispatchBody::Streaming { chunks, tokens_done },
                            },
                        )
                    }
                }
            }
        }
    }

    fn build_url(&self, upstream_model: &str, remaining_path: &str) -> String {
        let base = self.descriptor.base_url.trim_end_matches('/');
        match self.descriptor.kind {
            EndpointKind::AzureOpenAi => {
                let tail = azure_tail(remaining_path);
                format!(
                    "{base}/openai/deployments/{upstream_model}/{tail}?api-version={}",
                    self.descriptor.api_version
                )
            }
            EndpointKind::OpenAi => {
                let tail = openai_tail(remaining_path);
                format!("{base}/{tail}")
            }
        }
    }

    fn auth_headers(&self) -> Headers {
        match &self.descriptor.auth {
            AuthMaterial::ApiKey { api_key } => vec![("api-key".to_string(), api_key.clone())],
            AuthMaterial::Bearer { api_key, organization } => {
                let mut headers = vec![("Authorization".to_string(), format!("Bearer {api_key}"))];
                if let Some(org) = organization {
                    headers.push(("OpenAI-Organization".to_string(), org.clone()));
                }
                headers
            }
        }
    }

    fn usage(
        &self,
        details: &CallDetails,
        success: bool,
        elapsed: Duration,
        started_at: SystemTime,
        exact: Option<(u64, u64, u64)>,
    ) -> UsageInformation {
        let (prompt_tokens, completion_tokens, total_tokens) = match exact {
            Some((p, c, t)) => (Some(p), Some(c), Some(t)),
            None => (None, None, None),
        };
        UsageInformation {
            endpoint_id: self.descriptor.id.clone(),
            upstream_host: host_of(&self.descriptor.base_url),
            deployment_or_model: details
                .deployment_name
                .clone()
                .or_else(|| details.incoming_model_name.clone())
                .unwrap_or_default(),
            call_kind: details.call_kind,
            streaming: details.response_shape.is_streaming(),
            success,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            upstream_duration: elapsed,
            started_at,
            remaining_requests_hint: None,
            remaining_tokens_hint: None,
            estimated_completion_tokens: None,
        }
    }
}

struct RateLimitHints {
    remaining_requests: Option<u64>,
    remaining_tokens: Option<u64>,
}

fn apply_rate_limit_hints(mut usage: UsageInformation, hints: RateLimitHints) -> UsageInformation {
    usage.remaining_requests_hint = hints.remaining_requests;
    usage.remaining_tokens_hint = hints.remaining_tokens;
    usage
}

fn parse_rate_limit_hints(headers: &Headers) -> RateLimitHints {
    let get = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.parse::<u64>().ok())
    };
    RateLimitHints {
        remaining_requests: get("x-ratelimit-remaining-requests"),
        remaining_tokens: get("x-ratelimit-remaining-tokens"),
    }
}

fn parse_exact_usage(body: &Bytes) -> Option<(u64, u64, u64)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let prompt = usage.get("prompt_tokens")?.as_u64()?;
    let completion = usage.get("completion_tokens")?.as_u64()?;
    let total = usage
        .get("total_tokens")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(prompt + completion);
    Some((prompt, completion, total))
}

fn rewrite_model_field(raw_body: &Bytes, upstream_model: &str) -> Bytes {
    if raw_body.is_empty() {
        return raw_body.clone();
    }
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(raw_body) else {
        return raw_body.clone();
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "model".to_string(),
            serde_json::Value::String(upstream_model.to_string()),
        );
    }
    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => raw_body.clone(),
    }
}

/// Azure targets forward the path tail as-is; the deployment segment was
/// already consumed during classification.
fn azure_tail(remaining_path: &str) -> &str {
    const PREFIX_MARKERS: [&str; 6] = [
        "chat/completions",
        "completions",
        "embeddings",
        "images/generations",
        "audio/transcriptions",
        "audio/translations",
    ];
    for marker in PREFIX_MARKERS {
        if let Some(pos) = remaining_path.find(marker) {
            return &remaining_path[pos..];
        }
    }
    remaining_path.trim_start_matches('/')
}

/// OpenAI targets prefix the tail with `v1/`, rewriting from the Azure
/// shape when the incoming request used it.
fn openai_tail(remaining_path: &str) -> String {
    let tail = azure_tail(remaining_path);
    format!("v1/{tail}")
}

fn host_of(base_url: &str) -> String {
    base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(base_url)
        .to_string()
}

/// Deadline expirations surface as 504 to the caller; every other
/// transport failure (DNS, TLS, connect refusal, ...) surfaces as 502.
fn upstream_failure_status(failure: &UpstreamFailure) -> u16 {
    match failure {
        UpstreamFailure::Transport { kind, .. } => match kind {
            UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout => 504,
            _ => 502,
        },
    }
}

fn error_body(message: &str) -> Bytes {
    let body = serde_json::json!({ "error": { "message": message } });
    Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_tail_strips_deployment_prefix() {
        let tail = azure_tail("/openai/deployments/gpt4-prod/chat/completions");
        assert_eq!(tail, "chat/completions");
    }

    #[test]
    fn openai_tail_rewrites_from_azure_shape() {
        let tail = openai_tail("/openai/deployments/gpt4-prod/chat/completions");
        assert_eq!(tail, "v1/chat/completions");
    }

    #[test]
    fn rewrite_model_field_updates_json_body() {
        let body = Bytes::from(r#"{"model":"gpt-4","messages":[]}"#);
        let rewritten = rewrite_model_field(&body, "gpt4-prod");
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "gpt4-prod");
    }

    #[test]
    fn parse_exact_usage_reads_token_counts() {
        let body = Bytes::from(
            r#"{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        let (p, c, t) = parse_exact_usage(&body).unwrap();
        assert_eq!((p, c, t), (10, 5, 15));
    }

    #[test]
    fn timeout_failures_map_to_504_not_502() {
        use crate::upstream_client::UpstreamTransportErrorKind;

        let timeout = UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Timeout,
            message: "deadline exceeded".to_string(),
        };
        let read_timeout = UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::ReadTimeout,
            message: "idle timeout".to_string(),
        };
        let connect = UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Connect,
            message: "connection refused".to_string(),
        };

        assert_eq!(upstream_failure_status(&timeout), 504);
        assert_eq!(upstream_failure_status(&read_timeout), 504);
        assert_eq!(upstream_failure_status(&connect), 502);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn max_concurrency_caps_in_flight_upstream_calls() {
        use crate::upstream_client::{UpstreamHttpResponse};
        use std::collections::HashMap;
        use std::future::Future;
        use std::pin::Pin;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct SlowClient {
            in_flight: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        impl UpstreamClient for SlowClient {
            fn send<'a>(
                &'a self,
                _req: UpstreamHttpRequest,
            ) -> Pin<
                Box<
                    dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a,
                >,
            > {
                Box::pin(async move {
                    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Bytes(Bytes::from_static(b"{}")),
                    })
                })
            }
        }

        let descriptor = EndpointDescriptor {
            id: EndpointId::from("capped"),
            kind: EndpointKind::OpenAi,
            base_url: "https://example.test".to_string(),
            auth: AuthMaterial::Bearer {
                api_key: "k".to_string(),
                organization: None,
            },
            model_map: HashMap::from([("gpt-4".to_string(), "gpt-4".to_string())]),
            max_concurrency: Some(2),
            api_version: "2024-06-01".to_string(),
        };
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(SlowClient {
            in_flight: in_flight.clone(),
            peak: peak.clone(),
        });
        let latency = Arc::new(LatencyTracker::new([EndpointId::from("capped")]));
        let dispatcher = Arc::new(Dispatcher::new(descriptor, client, latency));

        use aicentral_common::{CallKind, ResponseShape};
        let details = Arc::new(CallDetails {
            call_kind: CallKind::Chat,
            incoming_model_name: Some("gpt-4".to_string()),
            deployment_name: None,
            assistant_id: None,
            prompt_text: None,
            response_shape: ResponseShape::Buffered,
            remaining_path: "/v1/chat/completions".to_string(),
            raw_body: Bytes::from(r#"{"model":"gpt-4"}"#),
            consumer_id: None,
            preferred_endpoint_id: None,
        });

        let mut handles = Vec::new();
        for _ in 0..6 {
            let dispatcher = dispatcher.clone();
            let details = details.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch(&details).await
            }));
        }
        for handle in handles {
            let (usage, _) = handle.await.unwrap();
            assert!(usage.success);
        }

        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "expected at most 2 concurrent upstream calls, saw {}",
            peak.load(Ordering::SeqCst)
        );
    }
}
