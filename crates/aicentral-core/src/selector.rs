use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aicentral_common::EndpointId;
use aicentral_protocol::{CallDetails, UsageInformation};
use rand::Rng;
use tokio::time::Instant;

use crate::dispatcher::{DispatchResponse, Dispatcher};

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Picks one `Dispatcher` from a set, possibly by delegating through a
/// sub-tree of selectors. Strategies are a tagged variant rather than a
/// trait hierarchy so composition (`Hierarchical`, `Affinity`) stays
/// transparent: everything ultimately bottoms out in `flatten()`.
pub enum Selector {
    Random(Vec<Arc<Dispatcher>>),
    /// Ordered tiers; each tier is tried in random order within itself
    /// before the next tier is attempted.
    Priority(Vec<Vec<Arc<Dispatcher>>>),
    LowestLatency(Vec<Arc<Dispatcher>>),
    Hierarchical(Vec<Selector>),
    Affinity {
        inner: Box<Selector>,
        table: AffinityTable,
        ttl: Duration,
    },
}

impl Selector {
    /// All leaf dispatchers reachable from this selector, recursively.
    pub fn flatten(&self) -> Vec<Arc<Dispatcher>> {
        match self {
            Selector::Random(endpoints) | Selector::LowestLatency(endpoints) => endpoints.clone(),
            Selector::Priority(tiers) => tiers.iter().flatten().cloned().collect(),
            Selector::Hierarchical(children) => {
                children.iter().flat_map(Selector::flatten).collect()
            }
            Selector::Affinity { inner, .. } => inner.flatten(),
        }
    }

    fn find(&self, id: &EndpointId) -> Option<Arc<Dispatcher>> {
        self.flatten().into_iter().find(|d| d.id() == id)
    }

    /// Picks a single dispatcher without dispatching anything. `Priority`
    /// has no single answer (its fail-over loop tries several), so it
    /// picks the first candidate of its first non-empty tier; callers that
    /// need cascade semantics should use [`Selector::execute`] instead.
    pub fn choose(&self, details: &CallDetails) -> Option<Arc<Dispatcher>> {
        match self {
            Selector::Random(endpoints) => random_pick(endpoints),
            Selector::Priority(tiers) => tiers.iter().find_map(|tier| random_pick(tier)),
            Selector::LowestLatency(endpoints) => lowest_latency_pick(endpoints),
            Selector::Hierarchical(children) => {
                random_pick(children).and_then(|child| child.choose(details))
            }
            Selector::Affinity { inner, table, .. } => {
                affinity_pick(details, table, inner).or_else(|| inner.choose(details))
            }
        }
    }

    /// Resolves an endpoint and performs the dispatch, applying the
    /// strategy's fail-over behavior (only `Priority` fails over across
    /// more than one dispatcher; every other strategy makes a single
    /// attempt). Returns the last response seen even when every candidate
    /// failed, per the no-fabricated-status rule.
    pub async fn execute(&self, details: &CallDetails) -> (UsageInformation, DispatchResponse) {
        match self {
            Selector::Priority(tiers) => self.execute_priority(tiers, details).await,
            Selector::Hierarchical(children) => {
                let Some(child) = random_pick(children) else {
                    return unroutable(details);
                };
                Box::pin(child.execute(details)).await
            }
            Selector::Affinity { inner, table, ttl } => {
                if let Some(dispatcher) = affinity_pick(details, table, inner) {
                    let (usage, response) = dispatcher.dispatch(details).await;
                    if usage.success {
                        table.record(details, &usage.endpoint_id, *ttl);
                    }
                    return (usage, response);
                }
                let (usage, response) = Box::pin(inner.execute(details)).await;
                if usage.success {
                    table.record(details, &usage.endpoint_id, *ttl);
                }
                (usage, response)
            }
            Selector::Random(_) | Selector::LowestLatency(_) => {
                let Some(dispatcher) = self.choose(details) else {
                    return unroutable(details);
                };
                dispatcher.dispatch(details).await
            }
        }
    }

    async fn execute_priority(
        &self,
        tiers: &[Vec<Arc<Dispatcher>>],
        details: &CallDetails,
    ) -> (UsageInformation, DispatchResponse) {
        let mut last: Option<(UsageInformation, DispatchResponse)> = None;
        for tier in tiers {
            let mut remaining: Vec<Arc<Dispatcher>> = tier.clone();
            while let Some(dispatcher) = random_pick(&remaining) {
                remaining.retain(|d| d.id() != dispatcher.id());
                let (usage, response) = dispatcher.dispatch(details).await;
                let retryable = is_retryable_status(response.status);
                if !retryable {
                    return (usage, response);
                }
                last = Some((usage, response));
            }
        }
        last.unwrap_or_else(|| unroutable(details))
    }
}

fn unroutable(details: &CallDetails) -> (UsageInformation, DispatchResponse) {
    let usage = UsageInformation {
        endpoint_id: EndpointId::from(""),
        upstream_host: String::new(),
        deployment_or_model: details
            .deployment_name
            .clone()
            .or_else(|| details.incoming_model_name.clone())
            .unwrap_or_default(),
        call_kind: details.call_kind,
        streaming: false,
        success: false,
        prompt_tokens: None,
        completion_tokens: None,
        total_tokens: None,
        upstream_duration: Duration::ZERO,
        started_at: std::time::SystemTime::now(),
        remaining_requests_hint: None,
        remaining_tokens_hint: None,
        estimated_completion_tokens: None,
    };
    let response = DispatchResponse {
        status: 503,
        headers: Vec::new(),
        body: crate::dispatcher::DispatchBody::Buffered(bytes::Bytes::from_static(
            br#"{"error":{"message":"no endpoint available"}}"#,
        )),
    };
    (usage, response)
}

fn random_pick<T: Clone>(items: &[T]) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    let index = rand::rng().random_range(0..items.len());
    items.get(index).cloned()
}

fn lowest_latency_pick(endpoints: &[Arc<Dispatcher>]) -> Option<Arc<Dispatcher>> {
    if endpoints.is_empty() {
        return None;
    }
    let unsampled: Vec<Arc<Dispatcher>> = endpoints
        .iter()
        .filter(|d| d.sampled_latency().is_none())
        .cloned()
        .collect();
    if !unsampled.is_empty() {
        return random_pick(&unsampled);
    }

    let mut best: Option<(Duration, Vec<Arc<Dispatcher>>)> = None;
    for d in endpoints {
        let Some(latency) = d.sampled_latency() else {
            continue;
        };
        match &mut best {
            None => best = Some((latency, vec![d.clone()])),
            Some((lowest, ties)) if latency < *lowest => {
                *lowest = latency;
                *ties = vec![d.clone()];
            }
            Some((lowest, ties)) if latency == *lowest => ties.push(d.clone()),
            _ => {}
        }
    }
    best.and_then(|(_, ties)| random_pick(&ties))
}

struct AffinityEntry {
    endpoint_id: EndpointId,
    expires_at: Instant,
}

/// Sticky `(consumerId, assistantId) -> endpointId` bindings with a TTL,
/// consulted by the `Affinity` selector variant.
pub struct AffinityTable {
    entries: Mutex<HashMap<(String, String), AffinityEntry>>,
}

impl Default for AffinityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(details: &CallDetails) -> Option<(String, String)> {
        let consumer = details.consumer_id.clone()?;
        let assistant = details.assistant_id.clone()?;
        Some((consumer, assistant))
    }

    fn lookup(&self, details: &CallDetails) -> Option<EndpointId> {
        let key = Self::key_for(details)?;
        let entries = self.entries.lock().expect("affinity table mutex poisoned");
        let entry = entries.get(&key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.endpoint_id.clone())
    }

    fn record(&self, details: &CallDetails, endpoint_id: &EndpointId, ttl: Duration) {
        let Some(key) = Self::key_for(details) else {
            return;
        };
        let mut entries = self.entries.lock().expect("affinity table mutex poisoned");
        entries.insert(
            key,
            AffinityEntry {
                endpoint_id: endpoint_id.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Resolves the dispatcher an affinity selector should prefer: an explicit
/// `x-aicentral-affinity` header wins outright; otherwise a live
/// `(consumer, assistant)` binding is consulted. A reference to an
/// endpoint outside the inner selector's set is ignored, per the
/// fall-back-never-error invariant.
fn affinity_pick(
    details: &CallDetails,
    table: &AffinityTable,
    inner: &Selector,
) -> Option<Arc<Dispatcher>> {
    let preferred = details
        .preferred_endpoint_id
        .as_ref()
        .map(|id| EndpointId::from(id.as_str()))
        .or_else(|| table.lookup(details));
    preferred.and_then(|id| inner.find(&id))
}
