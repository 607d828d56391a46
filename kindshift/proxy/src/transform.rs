//! One synchronous proxy exchange: read, rewrite, forward, relay.
//!
//! The state machine per exchange is
//! `ReadRequestBody -> [RewriteRequestBody] -> ForwardToTarget ->
//! ReadResponseBody (decompress) -> [RewriteResponseBody] -> FixHeaders ->
//! WriteToCaller`; nothing is written to the caller after an error, the
//! caller either gets the full relayed response or a short diagnostic.

use std::{io::Read, time::Instant};

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::{header, request, HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use kindshift_rewrite::{
    rewrite_admission_review, rewrite_json_payload, rewrite_patch, RewriteOutcome,
};
use tokio::net::TcpStream;

use crate::{
    error::{ProxyError, Result},
    full_body,
    headers::{adjust_accept, copy_headers, is_rewritable_json},
    metrics,
    resolve::TargetRequest,
    ProxyBody, ProxyState,
};

pub async fn proxy_exchange(
    state: &ProxyState,
    target: &TargetRequest,
    request: Request<Incoming>,
) -> Result<Response<ProxyBody>> {
    let (parts, body) = request.into_parts();
    let body = body
        .collect()
        .await
        .map_err(ProxyError::ClientBody)?
        .to_bytes();
    metrics::BODY_BYTES
        .with_label_values(&["in"])
        .inc_by(body.len() as u64);

    let body = rewrite_request_body(state, target, &parts.method, body)?;

    let upstream_request = build_upstream_request(state, target, &parts, body)?;
    let upstream_response = send_upstream(&state.target, upstream_request).await?;

    relay_response(state, target, upstream_response).await
}

/// Maps an internal failure to the status the caller sees: bad input on the
/// way in is the caller's fault, everything downstream is a gateway problem.
pub fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    let status = match error {
        ProxyError::RequestRewrite(_) | ProxyError::ClientBody(_) => StatusCode::BAD_REQUEST,
        ProxyError::ResponseRewrite(_)
        | ProxyError::Decompress { .. }
        | ProxyError::Upstream(_)
        | ProxyError::Io(_) => StatusCode::BAD_GATEWAY,
        ProxyError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(error.to_string()))
        .expect("static response build cannot fail")
}

fn rewrite_request_body(
    state: &ProxyState,
    target: &TargetRequest,
    method: &Method,
    body: Bytes,
) -> Result<Bytes> {
    if !target.rewrite_request || body.is_empty() {
        return Ok(body);
    }

    let started = Instant::now();
    let outcome = if *method == Method::PATCH {
        rewrite_patch(&state.rules, target.request_action, &body)
    } else if target.is_webhook {
        rewrite_admission_review(&state.rules, target.request_action, &body)
    } else {
        rewrite_json_payload(&state.rules, target.request_action, &body)
    }
    .map_err(ProxyError::RequestRewrite)?;
    metrics::REWRITE_SECONDS
        .with_label_values(&["request"])
        .observe(started.elapsed().as_secs_f64());

    match outcome {
        RewriteOutcome::Rewritten(bytes) => Ok(Bytes::from(bytes)),
        RewriteOutcome::Skipped => {
            tracing::debug!("request body matches no rule, forwarding as-is");
            Ok(body)
        }
    }
}

/// Builds the request sent downstream: mapped path, copied headers minus
/// hop-by-hop, recomputed `Content-Length`, `Host` pointing at the target,
/// and the JSON-forcing `Accept` adjustment.
pub(crate) fn build_upstream_request(
    state: &ProxyState,
    target: &TargetRequest,
    parts: &request::Parts,
    body: Bytes,
) -> Result<Request<ProxyBody>> {
    let mut headers = HeaderMap::new();
    copy_headers(&mut headers, &parts.headers);
    headers.insert(
        header::HOST,
        HeaderValue::from_str(&state.target).map_err(http::Error::from)?,
    );
    if body.is_empty() {
        headers.remove(header::CONTENT_LENGTH);
    } else {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    adjust_accept(target, &mut headers);

    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(target.path_and_query())
        .body(full_body(body))?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Opens a fresh connection to the target and performs one exchange on it.
pub(crate) async fn send_upstream(
    target_addr: &str,
    request: Request<ProxyBody>,
) -> Result<Response<Incoming>> {
    let stream = TcpStream::connect(target_addr).await?;
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::debug!(%error, "upstream connection closed with error");
        }
    });

    Ok(sender.send_request(request).await?)
}

async fn relay_response(
    state: &ProxyState,
    target: &TargetRequest,
    upstream: Response<Incoming>,
) -> Result<Response<ProxyBody>> {
    let (parts, body) = upstream.into_parts();
    let body = body.collect().await.map_err(ProxyError::Upstream)?.to_bytes();

    let (body, body_changed) = rewrite_response_body(state, target, &parts.headers, body)?;
    metrics::BODY_BYTES
        .with_label_values(&["out"])
        .inc_by(body.len() as u64);

    let body_len = body.len();
    let mut response = Response::builder()
        .status(parts.status)
        .body(full_body(body))?;
    let headers = response.headers_mut();
    if !body_changed {
        // Untouched bodies keep their original encoding on the wire.
        if let Some(encoding) = parts.headers.get(header::CONTENT_ENCODING) {
            headers.insert(header::CONTENT_ENCODING, encoding.clone());
        }
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    copy_headers(headers, &parts.headers);

    Ok(response)
}

/// Returns the final response body and whether it differs from the wire bytes
/// the target sent (rewritten, or decompressed without a rewrite).
fn rewrite_response_body(
    state: &ProxyState,
    target: &TargetRequest,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(Bytes, bool)> {
    if !target.rewrite_response || body.is_empty() {
        return Ok((body, false));
    }

    if !is_rewritable_json(headers) {
        tracing::warn!(
            content_type = ?headers.get(header::CONTENT_TYPE),
            "response content type cannot be rewritten, passing through"
        );
        return Ok((body, false));
    }

    let encoding = content_encoding(headers);
    let (decoded, was_compressed) = match encoding.as_deref() {
        None => (body, false),
        Some(encoding @ ("gzip" | "deflate")) => {
            let decoded = decompress(encoding, &body).map_err(|source| ProxyError::Decompress {
                encoding: encoding.to_string(),
                source,
            })?;
            (Bytes::from(decoded), true)
        }
        Some(other) => {
            tracing::warn!(
                encoding = other,
                "unsupported response content encoding, passing through"
            );
            return Ok((body, false));
        }
    };

    let started = Instant::now();
    let outcome = rewrite_json_payload(&state.rules, target.response_action, &decoded)
        .map_err(ProxyError::ResponseRewrite)?;
    metrics::REWRITE_SECONDS
        .with_label_values(&["response"])
        .observe(started.elapsed().as_secs_f64());

    match outcome {
        RewriteOutcome::Rewritten(bytes) => Ok((Bytes::from(bytes), true)),
        RewriteOutcome::Skipped => {
            tracing::debug!("response body matches no rule, forwarding as-is");
            Ok((decoded, was_compressed))
        }
    }
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
}

fn decompress(encoding: &str, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    match encoding {
        "gzip" => {
            GzDecoder::new(body).read_to_end(&mut decoded)?;
        }
        // HTTP deflate is zlib-wrapped.
        "deflate" => {
            ZlibDecoder::new(body).read_to_end(&mut decoded)?;
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("unsupported content encoding `{other}`"),
            ))
        }
    }
    Ok(decoded)
}
