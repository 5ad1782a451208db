use std::time::Duration;

use aicentral_protocol::ClassifyError;

/// The one error type every fallible pipeline stage returns. `status()`/
/// `retry_after()` project it onto the wire per the disposition table.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("admission rejected: {reason}")]
    AdmissionRejected {
        reason: &'static str,
        retry_after: Duration,
    },

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("model not mapped for this endpoint")]
    ModelUnmapped,

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ClassifyError> for GatewayError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::InvalidJson(msg) => GatewayError::MalformedRequest(msg),
            ClassifyError::MethodNotAllowed(label) => {
                GatewayError::MalformedRequest(format!("invalid method for {label}"))
            }
            ClassifyError::NotFound => GatewayError::MalformedRequest("unknown path".to_string()),
        }
    }
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::MalformedRequest(_) => 400,
            GatewayError::Unauthorized => 401,
            GatewayError::AdmissionRejected { .. } => 429,
            GatewayError::UpstreamTransient(_) => 502,
            GatewayError::ModelUnmapped => 404,
            GatewayError::Cancelled => 499,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::AdmissionRejected { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({ "error": { "message": self.to_string() } })
    }
}
