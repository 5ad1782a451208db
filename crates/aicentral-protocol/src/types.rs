use std::time::{Duration, SystemTime};

use aicentral_common::{CallKind, EndpointId, ResponseShape};
use bytes::Bytes;

/// Everything the pipeline needs to know about one request, derived once by
/// the classifier and immutable afterward.
#[derive(Debug, Clone)]
pub struct CallDetails {
    pub call_kind: CallKind,
    pub incoming_model_name: Option<String>,
    pub deployment_name: Option<String>,
    pub assistant_id: Option<String>,
    pub prompt_text: Option<String>,
    pub response_shape: ResponseShape,
    pub remaining_path: String,
    pub raw_body: Bytes,
    pub consumer_id: Option<String>,
    pub preferred_endpoint_id: Option<String>,
}

impl CallDetails {
    /// Derives the model-map lookup key: the incoming model name for
    /// OpenAI-shaped calls, or the deployment name for Azure-shaped ones.
    pub fn model_lookup_key(&self) -> Option<&str> {
        self.incoming_model_name
            .as_deref()
            .or(self.deployment_name.as_deref())
    }
}

/// Post-call telemetry produced by a dispatcher and consumed by the steps
/// that run on the return path.
#[derive(Debug, Clone)]
pub struct UsageInformation {
    pub endpoint_id: EndpointId,
    pub upstream_host: String,
    pub deployment_or_model: String,
    pub call_kind: CallKind,
    pub streaming: bool,
    pub success: bool,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub upstream_duration: Duration,
    pub started_at: SystemTime,
    pub remaining_requests_hint: Option<u64>,
    pub remaining_tokens_hint: Option<u64>,
    pub estimated_completion_tokens: Option<u64>,
}

impl UsageInformation {
    /// Exact if the upstream echoed a `usage` object, otherwise the
    /// streaming estimate, otherwise `None`.
    pub fn effective_completion_tokens(&self) -> Option<u64> {
        self.completion_tokens.or(self.estimated_completion_tokens)
    }
}
