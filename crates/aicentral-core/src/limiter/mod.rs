pub mod bulkhead;
pub mod request_rate;
pub mod token_rate;

use std::any::Any;

use aicentral_protocol::{CallDetails, UsageInformation};

use crate::error::GatewayError;

/// The opaque permit/reservation a step's `pre` hands back so `post` can
/// release or reconcile it. Steps that need no state return `StepToken::none()`.
pub struct StepToken(pub Box<dyn Any + Send>);

impl StepToken {
    pub fn none() -> Self {
        StepToken(Box::new(()))
    }

    pub fn new<T: Any + Send>(value: T) -> Self {
        StepToken(Box::new(value))
    }

    pub fn downcast<T: Any + Send>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|boxed| *boxed)
    }
}

/// A cross-cutting pipeline step: admits or rejects on the way in, and
/// reconciles or releases on the way out. `pre`/`post` are run as a stack —
/// `post` calls happen in the reverse order of the matching `pre` calls, so
/// a later step's rejection still triggers `post` for every step admitted
/// before it.
#[async_trait::async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn pre(&self, details: &CallDetails) -> Result<StepToken, GatewayError>;

    async fn post(&self, details: &CallDetails, token: StepToken, usage: Option<&UsageInformation>);
}
