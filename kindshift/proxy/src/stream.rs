//! One long-lived watch exchange.
//!
//! The target's chunked body is split into frames by
//! [`WatchFrameCodec`](crate::codec::WatchFrameCodec), each frame is rewritten
//! as one watch event, and every surviving event is pushed to the caller
//! immediately; nothing is buffered across events and nothing is reordered.
//! A malformed event never takes the stream down with it.

use std::{
    io,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use http::header;
use http_body_util::{BodyExt, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    Request, Response,
};
use kindshift_rewrite::{rewrite_watch_event, Action, RewriteOutcome};
use kindshift_rules::RuleTable;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{codec::FramedRead, io::StreamReader, sync::CancellationToken};

use crate::{
    codec::{CountingReader, WatchFrameCodec},
    error::{ProxyError, Result},
    headers::{copy_headers, is_rewritable_json},
    metrics,
    resolve::TargetRequest,
    transform, ProxyBody, ProxyState,
};

/// Frames buffered towards a slow caller before the pump awaits.
const EVENT_CHANNEL_CAPACITY: usize = 16;

pub async fn proxy_watch(
    state: &ProxyState,
    target: &TargetRequest,
    request: Request<Incoming>,
    shutdown: CancellationToken,
) -> Result<Response<ProxyBody>> {
    let (parts, body) = request.into_parts();
    let body = body
        .collect()
        .await
        .map_err(ProxyError::ClientBody)?
        .to_bytes();

    let upstream_request = transform::build_upstream_request(state, target, &parts, body)?;
    let upstream_response = transform::send_upstream(&state.target, upstream_request).await?;
    let (parts, upstream_body) = upstream_response.into_parts();

    let rewriting = target.rewrite_response
        && parts.status.is_success()
        && is_rewritable_json(&parts.headers)
        && !parts.headers.contains_key(header::CONTENT_ENCODING);

    if !rewriting {
        if target.rewrite_response {
            tracing::warn!(
                status = parts.status.as_u16(),
                content_type = ?parts.headers.get(header::CONTENT_TYPE),
                "watch response cannot be rewritten, passing stream through"
            );
        }

        let mut response = Response::builder()
            .status(parts.status)
            .body(upstream_body.boxed())?;
        let headers = response.headers_mut();
        for name in [header::CONTENT_LENGTH, header::CONTENT_ENCODING] {
            if let Some(value) = parts.headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }
        copy_headers(headers, &parts.headers);
        return Ok(response);
    }

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let pump = EventPump {
        rules: state.rules.clone(),
        action: target.response_action,
        shutdown,
    };
    tokio::spawn(pump.run(upstream_body, event_tx));

    // No Content-Length on the relayed stream: the rule table excludes it
    // from copying, so the connection falls back to chunked transfer.
    let mut response = Response::builder()
        .status(parts.status)
        .body(ProxyBody::new(StreamBody::new(ReceiverStream::new(
            event_rx,
        ))))?;
    copy_headers(response.headers_mut(), &parts.headers);

    Ok(response)
}

/// The per-connection decode loop, one spawned task per watch.
struct EventPump {
    rules: Arc<RuleTable>,
    action: Action,
    /// Per-connection stop signal; cancelled idempotently exactly once, by
    /// either side, and all teardown is gated on it.
    shutdown: CancellationToken,
}

impl EventPump {
    async fn run(self, body: Incoming, tx: mpsc::Sender<hyper::Result<Frame<Bytes>>>) {
        let _cancel_on_exit = self.shutdown.clone().drop_guard();

        let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
        let reader = CountingReader::new(reader);
        let counter = reader.counter();
        let mut frames = FramedRead::new(reader, WatchFrameCodec::default());

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("watch stopped by cancellation");
                    break;
                }
                next = frames.next() => next,
            };

            let Some(next) = next else {
                tracing::debug!("watch stream reached EOF");
                break;
            };
            let frame = match next {
                Ok(frame) => frame,
                Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("watch stream ended mid-frame");
                    break;
                }
                Err(error) if probably_eof(&error) => {
                    tracing::info!(%error, "watch stream closed by the network");
                    break;
                }
                Err(error) => {
                    tracing::error!(%error, "watch stream decode failed, stopping stream");
                    break;
                }
            };

            // Per-event byte accounting, reset after every decode cycle.
            let event_bytes = counter.swap(0, Ordering::Relaxed);

            let Some(event) = self.rewrite_event(&frame) else {
                continue;
            };
            tracing::trace!(bytes = event_bytes, "forwarding watch event");

            if tx.send(Ok(Frame::data(event))).await.is_err() {
                tracing::debug!("watch caller went away");
                break;
            }
        }
    }

    fn rewrite_event(&self, frame: &Bytes) -> Option<Bytes> {
        let started = Instant::now();
        let result = rewrite_watch_event(&self.rules, self.action, frame);
        metrics::REWRITE_SECONDS
            .with_label_values(&["event"])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(RewriteOutcome::Rewritten(event)) => {
                metrics::WATCH_EVENTS.with_label_values(&["rewritten"]).inc();
                Some(frame_with_newline(&event))
            }
            Ok(RewriteOutcome::Skipped) => {
                metrics::WATCH_EVENTS.with_label_values(&["skipped"]).inc();
                tracing::warn!("watch event matches no rule, dropping it");
                None
            }
            Err(error) => {
                // One bad event must not take down a live stream; forward the
                // original frame and keep going.
                metrics::WATCH_EVENTS.with_label_values(&["forwarded"]).inc();
                tracing::error!(%error, "failed to rewrite watch event, forwarding original");
                Some(frame_with_newline(frame))
            }
        }
    }
}

fn frame_with_newline(event: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(event.len() + 1);
    framed.extend_from_slice(event);
    framed.put_u8(b'\n');
    framed.freeze()
}

fn probably_eof(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}
