use thiserror::Error;

pub type Result<T, E = RewriteError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not {expected}")]
    UnexpectedShape { expected: &'static str },
}
