//! Optional diagnostics HTTP endpoint
//!
//! Bound to localhost only; serves a liveness probe and a JSON snapshot of
//! the proxy's counters. Enabled with the `--pprof` flag.

use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::proxy::Proxy;

/// Where the diagnostics endpoint listens
pub const DIAG_ADDR: &str = "127.0.0.1:6060";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Serve diagnostics until shutdown.
pub async fn run(proxy: Arc<Proxy>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(DIAG_ADDR).await?;
    info!(addr = DIAG_ADDR, "diagnostics endpoint listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let proxy = Arc::clone(&proxy);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle(req, Arc::clone(&proxy)));
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "diagnostics connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "diagnostics accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("diagnostics endpoint shutting down");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    proxy: Arc<Proxy>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/stats") => {
            let body = serde_json::to_string_pretty(&proxy.stats())
                .unwrap_or_else(|_| "{}".to_string());
            Ok(json_response(StatusCode::OK, body))
        }
        _ => Ok(response(StatusCode::NOT_FOUND, "not found")),
    }
}
