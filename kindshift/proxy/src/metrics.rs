//! Prometheus metrics for proxied exchanges.
//!
//! Collectors register lazily into the default registry; the text exposition
//! endpoint runs on its own listener so scrapes never mix with proxied API
//! traffic.

use std::{io, net::SocketAddr, sync::LazyLock};

use axum::{http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub static EXCHANGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "kindshift_exchanges_total",
        "Proxied HTTP exchanges by resource, method, watch flag and rewrite decision.",
        &["resource", "method", "watch", "rewritten"]
    )
    .expect("exchange counter registration")
});

pub static BODY_BYTES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "kindshift_body_bytes_total",
        "Request and response body bytes passing the proxy.",
        &["direction"]
    )
    .expect("body byte counter registration")
});

pub static WATCH_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "kindshift_watch_events_total",
        "Watch events by rewrite outcome.",
        &["outcome"]
    )
    .expect("watch event counter registration")
});

pub static REWRITE_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "kindshift_rewrite_duration_seconds",
        "Time spent rewriting one payload.",
        &["direction"]
    )
    .expect("rewrite histogram registration")
});

/// Serves `GET /metrics` until the shutdown token fires.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> io::Result<()> {
    let app = Router::new().route("/metrics", get(render));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics listener ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn render() -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder
        .encode(&prometheus::gather(), &mut buffer)
        .inspect_err(|error| tracing::error!(%error, "failed to encode prometheus metrics"))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
