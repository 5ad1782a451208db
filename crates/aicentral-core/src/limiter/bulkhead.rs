use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use aicentral_common::partition::PartitionKey;
use aicentral_common::{ConsumerId, PartitionMode};
use aicentral_protocol::{CallDetails, UsageInformation};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{PipelineStep, StepToken};
use crate::error::GatewayError;

/// Fixed-size concurrency cap. `pre` acquires a permit (rejecting fast when
/// none are free, or waiting up to an optional queue timeout); `post`
/// releases it by letting the permit drop.
pub struct BulkheadStep {
    capacity: usize,
    queue_timeout: Option<Duration>,
    mode: PartitionMode,
    semaphores: Mutex<HashMap<PartitionKey, Arc<Semaphore>>>,
}

impl BulkheadStep {
    pub fn new(capacity: usize, queue_timeout: Option<Duration>, mode: PartitionMode) -> Self {
        Self {
            capacity,
            queue_timeout,
            mode,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, partition: PartitionKey) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().expect("bulkhead mutex poisoned");
        semaphores
            .entry(partition)
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity)))
            .clone()
    }

    fn partition_key(&self, details: &CallDetails) -> PartitionKey {
        let consumer = details.consumer_id.as_deref().map(ConsumerId::from);
        self.mode.key_for(consumer.as_ref())
    }
}

#[async_trait::async_trait]
impl PipelineStep for BulkheadStep {
    fn name(&self) -> &'static str {
        "bulkhead"
    }

    async fn pre(&self, details: &CallDetails) -> Result<StepToken, GatewayError> {
        let semaphore = self.semaphore_for(self.partition_key(details));

        let permit = match self.queue_timeout {
            None => semaphore.try_acquire_owned().map_err(|_| rejected())?,
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| rejected())?
                .expect("semaphore never closed"),
        };

        Ok(StepToken::new(permit))
    }

    async fn post(&self, _details: &CallDetails, token: StepToken, _usage: Option<&UsageInformation>) {
        // Dropping the permit releases the slot; nothing else to reconcile.
        let _permit: Option<OwnedSemaphorePermit> = token.downcast();
    }
}

fn rejected() -> GatewayError {
    GatewayError::AdmissionRejected {
        reason: "bulkhead capacity exceeded",
        retry_after: Duration::from_secs(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use aicentral_common::{CallKind, ResponseShape};

    fn details(consumer: Option<&str>) -> CallDetails {
        CallDetails {
            call_kind: CallKind::Chat,
            incoming_model_name: None,
            deployment_name: None,
            assistant_id: None,
            prompt_text: None,
            response_shape: ResponseShape::Buffered,
            remaining_path: "/v1/chat/completions".to_string(),
            raw_body: Bytes::new(),
            consumer_id: consumer.map(str::to_string),
            preferred_endpoint_id: None,
        }
    }

    #[tokio::test]
    async fn admits_up_to_capacity_then_rejects() {
        let step = BulkheadStep::new(2, None, PartitionMode::PerPipeline);
        let t1 = step.pre(&details(None)).await.unwrap();
        let t2 = step.pre(&details(None)).await.unwrap();
        let rejected = step.pre(&details(None)).await;
        assert!(rejected.is_err());

        step.post(&details(None), t1, None).await;
        // releasing one permit makes room again
        let t3 = step.pre(&details(None)).await.unwrap();
        step.post(&details(None), t2, None).await;
        step.post(&details(None), t3, None).await;
    }

    #[tokio::test]
    async fn per_consumer_partitions_are_independent() {
        let step = BulkheadStep::new(1, None, PartitionMode::PerConsumer);
        let t1 = step.pre(&details(Some("a"))).await.unwrap();
        // "b" has its own bucket, unaffected by "a" holding its only permit
        let t2 = step.pre(&details(Some("b"))).await.unwrap();
        assert!(step.pre(&details(Some("a"))).await.is_err());
        step.post(&details(Some("a")), t1, None).await;
        step.post(&details(Some("b")), t2, None).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn capacity_5_with_10_concurrent_1s_requests_completes_in_about_2s() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Instant;

        let step = Arc::new(BulkheadStep::new(
            5,
            Some(Duration::from_secs(5)),
            PartitionMode::PerPipeline,
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let step = step.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let token = step.pre(&details(None)).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                step.post(&details(None), token, None).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 5);
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1900) && elapsed < Duration::from_millis(3500),
            "expected ~2s for two waves of 5 at capacity 5, got {elapsed:?}"
        );
    }
}
