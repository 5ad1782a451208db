use serde::{Deserialize, Serialize};

/// Stable identifier for a configured upstream endpoint; doubles as a
/// metric/partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        EndpointId(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        EndpointId(value)
    }
}

/// Identifies the authenticated caller, assigned by the auth step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub String);

impl ConsumerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(value: &str) -> Self {
        ConsumerId(value.to_string())
    }
}

impl From<String> for ConsumerId {
    fn from(value: String) -> Self {
        ConsumerId(value)
    }
}
