#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("invalid method for {0}")]
    MethodNotAllowed(&'static str),
    #[error("unknown path shape")]
    NotFound,
    #[error("invalid json body: {0}")]
    InvalidJson(String),
}
