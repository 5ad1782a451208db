use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aicentral_common::partition::PartitionKey;
use aicentral_common::{ConsumerId, PartitionMode};
use aicentral_protocol::{CallDetails, UsageInformation};
use tokio::time::Instant;

use super::{PipelineStep, StepToken};
use crate::error::GatewayError;
use crate::token_estimate::estimate_tokens;

struct Bucket {
    charged: u64,
    started_at: Instant,
}

type State = Arc<Mutex<HashMap<PartitionKey, Bucket>>>;

fn adjust(state: &State, key: &PartitionKey, delta: i64) {
    let mut state = state.lock().expect("token rate mutex poisoned");
    if let Some(bucket) = state.get_mut(key) {
        bucket.charged = (bucket.charged as i64 + delta).max(0) as u64;
    }
}

/// One reservation handed from `pre` to `post`: how many tokens were
/// provisionally charged for the prompt, to be reconciled against the
/// actual usage once the call completes. `post` calls [`Reservation::settle`]
/// with the real delta; if the request is cancelled instead (the token is
/// simply dropped, `post` never runs), `Drop` refunds the full reservation
/// so the budget never leaks.
struct Reservation {
    key: PartitionKey,
    estimated: u64,
    state: State,
    settled: bool,
}

impl Reservation {
    fn settle(mut self, delta: i64) {
        self.settled = true;
        adjust(&self.state, &self.key, delta);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            adjust(&self.state, &self.key, -(self.estimated as i64));
        }
    }
}

/// Bucket of capacity `tokens` per `window`, reset on window rollover.
/// `pre` reserves a char-count estimate of the prompt; `post` reconciles
/// the reservation against exact or estimated completion usage so
/// over-estimates are refunded and under-estimates are charged.
pub struct TokenRateStep {
    capacity: u64,
    window: Duration,
    mode: PartitionMode,
    state: State,
}

impl TokenRateStep {
    pub fn new(capacity: u64, window: Duration, mode: PartitionMode) -> Self {
        Self {
            capacity,
            window,
            mode,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn partition_key(&self, details: &CallDetails) -> PartitionKey {
        let consumer = details.consumer_id.as_deref().map(ConsumerId::from);
        self.mode.key_for(consumer.as_ref())
    }
}

#[async_trait::async_trait]
impl PipelineStep for TokenRateStep {
    fn name(&self) -> &'static str {
        "token_rate"
    }

    async fn pre(&self, details: &CallDetails) -> Result<StepToken, GatewayError> {
        let key = self.partition_key(details);
        let estimated = details
            .prompt_text
            .as_deref()
            .map(estimate_tokens)
            .unwrap_or(0);
        let now = Instant::now();

        let mut state = self.state.lock().expect("token rate mutex poisoned");
        let bucket = state.entry(key.clone()).or_insert_with(|| Bucket {
            charged: 0,
            started_at: now,
        });

        if now.duration_since(bucket.started_at) >= self.window {
            bucket.charged = 0;
            bucket.started_at = now;
        }

        if bucket.charged + estimated > self.capacity {
            let elapsed = now.duration_since(bucket.started_at);
            let retry_after = self.window.saturating_sub(elapsed);
            return Err(GatewayError::AdmissionRejected {
                reason: "token rate limit exceeded",
                retry_after,
            });
        }

        bucket.charged += estimated;
        Ok(StepToken::new(Reservation {
            key,
            estimated,
            state: self.state.clone(),
            settled: false,
        }))
    }

    async fn post(
        &self,
        _details: &CallDetails,
        token: StepToken,
        usage: Option<&UsageInformation>,
    ) {
        let Some(reservation) = token.downcast::<Reservation>() else {
            return;
        };

        match usage.filter(|u| u.success) {
            None => {
                // The call never completed successfully: refund the full
                // reservation, nothing was actually consumed.
                let estimated = reservation.estimated;
                reservation.settle(-(estimated as i64));
            }
            Some(usage) => {
                if let Some(total) = usage.total_tokens {
                    let delta = total as i64 - reservation.estimated as i64;
                    reservation.settle(delta);
                } else if let Some(completion) = usage.estimated_completion_tokens {
                    let delta = completion as i64;
                    reservation.settle(delta);
                } else {
                    // No usage figure at all: treat as fully consumed per
                    // the reservation estimate, same as a normal admit.
                    reservation.settle(0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aicentral_common::{CallKind, ResponseShape};
    use aicentral_protocol::UsageInformation;
    use bytes::Bytes;

    fn details(prompt: &str) -> CallDetails {
        CallDetails {
            call_kind: CallKind::Chat,
            incoming_model_name: None,
            deployment_name: None,
            assistant_id: None,
            prompt_text: Some(prompt.to_string()),
            response_shape: ResponseShape::Streaming,
            remaining_path: "/v1/chat/completions".to_string(),
            raw_body: Bytes::new(),
            consumer_id: None,
            preferred_endpoint_id: None,
        }
    }

    fn usage(total: Option<u64>, estimated_completion: Option<u64>) -> UsageInformation {
        UsageInformation {
            endpoint_id: "azure-east".into(),
            upstream_host: "azure-east.example.com".to_string(),
            deployment_or_model: "gpt4-prod".to_string(),
            call_kind: CallKind::Chat,
            streaming: true,
            success: true,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: total,
            upstream_duration: Duration::from_millis(10),
            started_at: std::time::SystemTime::now(),
            remaining_requests_hint: None,
            remaining_tokens_hint: None,
            estimated_completion_tokens: estimated_completion,
        }
    }

    #[tokio::test]
    async fn streaming_reconciliation_charges_estimated_completion() {
        let step = TokenRateStep::new(50, Duration::from_secs(60), PartitionMode::PerPipeline);

        // "a" x 80 chars -> 20-token estimate, admitted
        let prompt = "a".repeat(80);
        let d = details(&prompt);
        let token = step.pre(&d).await.unwrap();
        step.post(&d, token, Some(&usage(None, Some(45)))).await;

        // second identical request now exceeds the 50-token budget (20 + 45 = 65 > 50)
        let second = step.pre(&d).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn failed_call_refunds_the_full_reservation() {
        let step = TokenRateStep::new(20, Duration::from_secs(60), PartitionMode::PerPipeline);
        let prompt = "a".repeat(80); // 20-token estimate, fills the whole bucket
        let d = details(&prompt);
        let token = step.pre(&d).await.unwrap();

        let mut failed = usage(None, None);
        failed.success = false;
        step.post(&d, token, Some(&failed)).await;

        // refunded, so an identical request is admitted again
        assert!(step.pre(&d).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_a_reservation_without_post_refunds_it() {
        let step = TokenRateStep::new(20, Duration::from_secs(60), PartitionMode::PerPipeline);
        let prompt = "a".repeat(80); // 20-token estimate, fills the whole bucket
        let d = details(&prompt);

        {
            // simulates a cancelled request: the token obtained from `pre`
            // is simply dropped, `post` never runs.
            let _token = step.pre(&d).await.unwrap();
        }

        // the dropped reservation's Drop guard refunds the budget, so an
        // identical request is admitted again instead of staying rejected.
        assert!(step.pre(&d).await.is_ok());
    }
}
