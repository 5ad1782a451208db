use std::collections::HashMap;

use aicentral_common::EndpointId;
use serde::{Deserialize, Serialize};

/// Which upstream shape an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    #[serde(rename = "azure_openai")]
    AzureOpenAi,
    #[serde(rename = "openai")]
    OpenAi,
}

/// Auth material carried by one endpoint. AzureOpenAI uses an `api-key`
/// header; OpenAI uses a bearer token plus an optional organization id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMaterial {
    ApiKey { api_key: String },
    Bearer {
        api_key: String,
        organization: Option<String>,
    },
}

/// Immutable, process-lifetime upstream configuration. Built once at
/// startup from the declarative configuration document; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: EndpointId,
    pub kind: EndpointKind,
    pub base_url: String,
    pub auth: AuthMaterial,
    pub model_map: HashMap<String, String>,
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_api_version() -> String {
    "2024-06-01".to_string()
}

impl EndpointDescriptor {
    pub fn resolve_upstream_model(&self, incoming: &str) -> Option<&str> {
        self.model_map.get(incoming).map(String::as_str)
    }
}
