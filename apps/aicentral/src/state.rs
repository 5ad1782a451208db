use std::collections::HashMap;
use std::sync::Arc;

use aicentral_core::Pipeline;

/// Process-lifetime pipeline registry, indexed by the hostname each pipeline
/// is bound to. Built once at startup from the configuration document;
/// hot-reload is out of scope, so a plain map needs no interior mutability.
#[derive(Clone)]
pub struct AppState {
    pipelines: Arc<HashMap<String, Arc<Pipeline>>>,
}

impl AppState {
    pub fn new(pipelines: HashMap<String, Arc<Pipeline>>) -> Self {
        Self {
            pipelines: Arc::new(pipelines),
        }
    }

    pub fn pipeline_for_host(&self, host: &str) -> Option<Arc<Pipeline>> {
        let host = host.split(':').next().unwrap_or(host);
        self.pipelines.get(host).cloned()
    }
}
