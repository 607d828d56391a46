//! The kindshift proxy core: request resolution, synchronous exchange
//! transformation, watch-stream transformation, and the front-door HTTP
//! server.
//!
//! Everything here is stateless across exchanges. The shared [`ProxyState`]
//! holds the rule table (read-only after startup) and the fixed proxy mode;
//! each exchange derives its own immutable decision record via
//! [`resolve::resolve`] and owns its buffers until the exchange ends.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use kindshift_rules::RuleTable;

pub mod codec;
mod error;
pub mod metrics;
pub mod resolve;
pub mod server;
pub mod stream;
pub mod transform;

mod headers;

pub use error::{ProxyError, Result};
pub use headers::HeaderRule;
pub use resolve::{ProxyMode, TargetRequest};
pub use server::ProxyServer;

/// Body type used on every caller-facing response.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Shared per-instance state, cheap to clone into connection tasks.
#[derive(Debug, Clone)]
pub struct ProxyState {
    pub rules: Arc<RuleTable>,
    pub mode: ProxyMode,
    /// Backend `host:port` every exchange is forwarded to.
    pub target: String,
}

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}
