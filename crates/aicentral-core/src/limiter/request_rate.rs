use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use aicentral_common::partition::PartitionKey;
use aicentral_common::{ConsumerId, PartitionMode};
use aicentral_protocol::{CallDetails, UsageInformation};
use tokio::time::Instant;

use super::{PipelineStep, StepToken};
use crate::error::GatewayError;

struct Window {
    count: u32,
    started_at: Instant,
}

/// Fixed window of length `window` admitting up to `capacity` requests.
/// Tokens are consumed at admission; `post` is a no-op.
pub struct RequestRateStep {
    capacity: u32,
    window: Duration,
    mode: PartitionMode,
    state: Mutex<HashMap<PartitionKey, Window>>,
}

impl RequestRateStep {
    pub fn new(capacity: u32, window: Duration, mode: PartitionMode) -> Self {
        Self {
            capacity,
            window,
            mode,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn partition_key(&self, details: &CallDetails) -> PartitionKey {
        let consumer = details.consumer_id.as_deref().map(ConsumerId::from);
        self.mode.key_for(consumer.as_ref())
    }
}

#[async_trait::async_trait]
impl PipelineStep for RequestRateStep {
    fn name(&self) -> &'static str {
        "request_rate"
    }

    async fn pre(&self, details: &CallDetails) -> Result<StepToken, GatewayError> {
        let key = self.partition_key(details);
        let now = Instant::now();
        let mut state = self.state.lock().expect("request rate mutex poisoned");
        let window = state.entry(key).or_insert_with(|| Window {
            count: 0,
            started_at: now,
        });

        if now.duration_since(window.started_at) >= self.window {
            window.count = 0;
            window.started_at = now;
        }

        if window.count < self.capacity {
            window.count += 1;
            Ok(StepToken::none())
        } else {
            let elapsed = now.duration_since(window.started_at);
            let retry_after = self.window.saturating_sub(elapsed);
            Err(GatewayError::AdmissionRejected {
                reason: "request rate limit exceeded",
                retry_after,
            })
        }
    }

    async fn post(&self, _details: &CallDetails, _token: StepToken, _usage: Option<&UsageInformation>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use aicentral_common::{CallKind, ResponseShape};
    use bytes::Bytes;

    fn details(consumer: &str) -> CallDetails {
        CallDetails {
            call_kind: CallKind::Chat,
            incoming_model_name: None,
            deployment_name: None,
            assistant_id: None,
            prompt_text: None,
            response_shape: ResponseShape::Buffered,
            remaining_path: "/v1/chat/completions".to_string(),
            raw_body: Bytes::new(),
            consumer_id: Some(consumer.to_string()),
            preferred_endpoint_id: None,
        }
    }

    #[tokio::test]
    async fn per_consumer_rate_limit_is_independent() {
        let step =
            RequestRateStep::new(2, Duration::from_secs(60), PartitionMode::PerConsumer);

        step.pre(&details("client-1")).await.unwrap();
        step.pre(&details("client-1")).await.unwrap();
        let third = step.pre(&details("client-1")).await;
        assert!(third.is_err());

        // client-2 is unaffected by client-1's exhausted window
        step.pre(&details("client-2")).await.unwrap();
    }
}
