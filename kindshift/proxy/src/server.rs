//! The proxy front door: accept loop, per-request dispatch, exchange logs.

use std::{convert::Infallible, future::Future, io, pin::Pin, sync::Arc, time::Instant};

use hyper::{body::Incoming, server::conn::http1, service::Service, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{metrics, resolve, stream, transform, ProxyBody, ProxyState};

/// Accepts client connections and serves each over HTTP/1 until shut down.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(state: ProxyState, shutdown: CancellationToken) -> Self {
        Self {
            state: Arc::new(state),
            shutdown,
        }
    }

    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let mut connection_tasks = JoinSet::new();

        loop {
            let stream = tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        tracing::warn!(%error, "failed to accept client connection");
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            let service = FrontDoor {
                state: self.state.clone(),
                shutdown: self.shutdown.clone(),
            };
            let shutdown = self.shutdown.clone();
            connection_tasks.spawn(async move {
                let mut connection = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(TokioIo::new(stream), service);

                tokio::select! {
                    result = &mut connection => {
                        if let Err(error) = result {
                            tracing::debug!(%error, "client connection ended with error");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        Pin::new(&mut connection).graceful_shutdown();
                        let _ = connection.await;
                    }
                }
            });
        }

        // Drain in-flight exchanges before returning.
        while connection_tasks.join_next().await.is_some() {}
        Ok(())
    }
}

#[derive(Clone)]
struct FrontDoor {
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
}

impl Service<Request<Incoming>> for FrontDoor {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        Box::pin(async move { Ok(handle_request(state, shutdown, request).await) })
    }
}

async fn handle_request(
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
    request: Request<Incoming>,
) -> Response<ProxyBody> {
    let method = request.method().clone();
    let target = resolve::resolve(&state.rules, state.mode, &method, request.uri());
    let started = Instant::now();

    let result = if target.is_watch {
        stream::proxy_watch(&state, &target, request, shutdown.child_token()).await
    } else {
        transform::proxy_exchange(&state, &target, request).await
    };

    let response = match result {
        Ok(response) => response,
        Err(error) => {
            tracing::error!(%error, path = target.path(), "proxy exchange failed");
            transform::error_response(&error)
        }
    };

    let rewritten = target.rewrite_request || target.rewrite_response;
    metrics::EXCHANGES
        .with_label_values(&[
            target.resource.as_str(),
            method.as_str(),
            bool_label(target.is_watch),
            bool_label(rewritten),
        ])
        .inc();
    tracing::info!(
        resource = %target.resource,
        method = %method,
        watch = target.is_watch,
        rewrite_request = target.rewrite_request,
        rewrite_response = target.rewrite_response,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "proxied exchange"
    );

    response
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
