use serde::{Deserialize, Serialize};

use crate::ConsumerId;

/// How a limiter's state is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// One counter/bucket shared by every request through the pipeline.
    PerPipeline,
    /// One counter/bucket per consumer id; requests without a consumer
    /// fall back to the pipeline-wide partition.
    PerConsumer,
}

/// A partition's identity within a limiter's state map. `Pipeline` is the
/// single shared bucket; `Consumer` is only produced when `PartitionMode`
/// is `PerConsumer` and the request actually carries a consumer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    Pipeline,
    Consumer(ConsumerId),
}

impl PartitionMode {
    pub fn key_for(&self, consumer: Option<&ConsumerId>) -> PartitionKey {
        match (self, consumer) {
            (PartitionMode::PerConsumer, Some(id)) => PartitionKey::Consumer(id.clone()),
            _ => PartitionKey::Pipeline,
        }
    }
}
