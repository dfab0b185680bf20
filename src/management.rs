//! Combined metrics/health/ready management server (§6): one port serving `GET /metrics`,
//! `GET /health`, and `GET /ready`. Kept on a separate listener from the data-plane port
//! so it can keep answering through the drain window after the main listener closes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::drain::DrainState;
use crate::store::ConfigStore;

type Body = BoxBody<Bytes, Infallible>;

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())).boxed())
        .unwrap()
}

struct ManagementState {
    registry: Registry,
    drain: DrainState,
    store: Option<Arc<dyn ConfigStore>>,
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<tokio::sync::Mutex<ManagementState>>,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/health") => Ok(text(StatusCode::OK, "OK")),
        (&hyper::Method::GET, "/ready") => Ok(handle_ready(state).await),
        (&hyper::Method::GET, "/metrics") => Ok(handle_metrics(state).await),
        _ => Ok(text(StatusCode::NOT_FOUND, "not found")),
    }
}

async fn handle_ready(state: Arc<tokio::sync::Mutex<ManagementState>>) -> Response<Body> {
    let guard = state.lock().await;
    if guard.drain.is_draining() {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Full::new(Bytes::from_static(b"Draining")).boxed())
            .unwrap();
    }
    if let Some(store) = &guard.store {
        if let Err(e) = store.health().await {
            let body = format!("Redis Unavailable: {e}");
            return Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Full::new(Bytes::from(body)).boxed())
                .unwrap();
        }
    }
    text(StatusCode::OK, "Ready")
}

async fn handle_metrics(state: Arc<tokio::sync::Mutex<ManagementState>>) -> Response<Body> {
    let guard = state.lock().await;
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &guard.registry) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header(
                hyper::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Full::new(Bytes::from(buf)).boxed())
            .unwrap(),
        Err(e) => text_owned(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn text_owned(status: StatusCode, body: String) -> Response<Body> {
    Response::builder().status(status).body(Full::new(Bytes::from(body)).boxed()).unwrap()
}

/// Serves the management endpoints until `shutdown` fires, then gives in-flight
/// connections up to `graceful_timeout` before returning. The metrics/health endpoint
/// must stay up through the drain window (§4.6 step 2-4); the caller only flips
/// `shutdown` at step 5.
pub async fn serve(
    addr: SocketAddr,
    registry: Registry,
    drain: DrainState,
    store: Option<Arc<dyn ConfigStore>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "management server listening");
    let state = Arc::new(tokio::sync::Mutex::new(ManagementState { registry, drain, store }));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("management server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "management server accept error");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| handle(req, state.clone()));
                    let _ = http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FakeStore {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl ConfigStore for FakeStore {
        async fn load_business(&self) -> Result<crate::store::BusinessConfig, crate::store::StoreError> {
            unimplemented!()
        }
        async fn load_security(&self) -> crate::store::SecurityPolicy {
            crate::store::SecurityPolicy::default()
        }
        async fn health(&self) -> Result<(), crate::store::StoreError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(crate::store::StoreError::Unreachable("down".to_string()))
            }
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf).to_string();
        let status: u16 = text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap();
        (status, text)
    }

    #[tokio::test]
    async fn health_always_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(addr, Registry::default(), DrainState::new(), None, shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (status, body) = get(addr, "/health").await;
        assert_eq!(status, 200);
        assert!(body.contains("OK"));
    }

    #[tokio::test]
    async fn ready_reflects_drain_and_store_health() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let drain = DrainState::new();
        let store: Arc<dyn ConfigStore> = Arc::new(FakeStore { healthy: AtomicBool::new(true) });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(addr, Registry::default(), drain.clone(), Some(store), shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (status, _) = get(addr, "/ready").await;
        assert_eq!(status, 200);

        drain.begin_draining();
        let (status, body) = get(addr, "/ready").await;
        assert_eq!(status, 503);
        assert!(body.contains("Draining"));
    }
}
