use kindshift_rewrite::RewriteError;
use thiserror::Error;

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed reading the caller's request body.
    #[error("failed to read request body: {0}")]
    ClientBody(#[source] hyper::Error),

    /// Transport or protocol failure talking to the target.
    #[error("upstream exchange failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("invalid outbound request: {0}")]
    Http(#[from] http::Error),

    #[error("failed to rewrite request body: {0}")]
    RequestRewrite(#[source] RewriteError),

    #[error("failed to rewrite response body: {0}")]
    ResponseRewrite(#[source] RewriteError),

    #[error("failed to decode `Content-Encoding: {encoding}` response body: {source}")]
    Decompress {
        encoding: String,
        #[source]
        source: std::io::Error,
    },
}
