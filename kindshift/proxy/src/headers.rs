//! Header handling policy for proxied exchanges.
//!
//! Copy precedence is an explicit rule table instead of ad hoc checks:
//! every header is either always recomputed by the proxy, copied only when
//! the outbound message does not carry it yet, or never copied at all.

use http::{header, HeaderMap, HeaderValue};

use crate::resolve::TargetRequest;

/// How one header name is treated when relaying a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRule {
    /// The proxy owns this header and recomputes it from the final body.
    AlwaysRecompute,
    /// Copied from the source message unless already set explicitly.
    CopyIfAbsent,
    /// Hop-by-hop; never crosses the proxy.
    NeverCopy,
}

impl HeaderRule {
    pub fn for_name(name: &header::HeaderName) -> Self {
        const HOP_BY_HOP: [header::HeaderName; 7] = [
            header::TRANSFER_ENCODING,
            header::CONNECTION,
            header::UPGRADE,
            header::TE,
            header::TRAILER,
            header::PROXY_AUTHENTICATE,
            header::PROXY_AUTHORIZATION,
        ];

        if *name == header::CONTENT_LENGTH || *name == header::CONTENT_ENCODING {
            Self::AlwaysRecompute
        } else if HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive" {
            Self::NeverCopy
        } else {
            Self::CopyIfAbsent
        }
    }
}

/// Copies headers from `src` into `dst` per the rule table. A header the
/// destination already set explicitly is never overwritten.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        if HeaderRule::for_name(name) != HeaderRule::CopyIfAbsent {
            continue;
        }
        if dst.contains_key(name) {
            continue;
        }
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Rewrites the `Accept` header on the upstream request.
///
/// The rewrite engine only operates on JSON, so whenever the response will be
/// rewritten the upstream must not negotiate protobuf or `as=Table` output.
/// This is a protocol-compatibility workaround, not content negotiation.
pub fn adjust_accept(target: &TargetRequest, headers: &mut HeaderMap) {
    let json = HeaderValue::from_static("application/json");

    if target.rewrite_response {
        headers.insert(header::ACCEPT, json);
    } else if target.is_watch
        && (target.is_crd || target.is_core)
        && !headers.contains_key(header::ACCEPT)
    {
        headers.insert(header::ACCEPT, json);
    }
}

/// Whether a response body with this `Content-Type` may be handed to the
/// rewrite engine. Anything that is not plain `application/json` (protobuf,
/// `;as=Table` variants, unknown types) must pass through untouched.
pub fn is_rewritable_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };

    let mut parts = content_type.split(';');
    let essence = parts.next().unwrap_or_default().trim();
    if !essence.eq_ignore_ascii_case("application/json") {
        return false;
    }

    parts.all(|param| {
        let param = param.trim();
        param.is_empty() || param.to_ascii_lowercase().starts_with("charset=")
    })
}
