//! TCP Splicer (C5): relays an opaque-TCP sniffed connection to the configured upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::error::GatewayError;
use crate::kernel::KernelRedirector;
use crate::metrics::{DirectionLabel, Metrics};
use crate::policy::PolicyEngine;
use crate::proxy::copy::{self, ConnectionResult};
use crate::sniff::WrappedStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle(
    client: WrappedStream,
    remote_addr: SocketAddr,
    upstream_addr: &str,
    policy: &PolicyEngine,
    metrics: &Arc<Metrics>,
    kernel: &Arc<dyn KernelRedirector>,
) {
    let start = Instant::now();

    let upstream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(upstream_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = GatewayError::UpstreamUnavailable {
                detail: format!("dial failed: {e}"),
            };
            tracing::debug!(remote = %remote_addr, upstream = upstream_addr, error = %err, "tcp dial failed");
            policy.audit_tcp(remote_addr, upstream_addr, false, Some(err.to_string()));
            return;
        }
        Err(_) => {
            let err = GatewayError::UpstreamUnavailable {
                detail: "dial timed out".to_string(),
            };
            tracing::debug!(remote = %remote_addr, upstream = upstream_addr, error = %err, "tcp dial timed out");
            policy.audit_tcp(remote_addr, upstream_addr, false, Some(err.to_string()));
            return;
        }
    };

    policy.audit_tcp(remote_addr, upstream_addr, true, None);

    let client_identity = client
        .get_ref()
        .local_addr()
        .ok()
        .zip(client.get_ref().peer_addr().ok())
        .map(|(l, p)| crate::kernel::socket_identity(l, p));
    let upstream_identity = upstream
        .local_addr()
        .ok()
        .zip(upstream.peer_addr().ok())
        .map(|(l, p)| crate::kernel::socket_identity(l, p));

    if let (Some(c), Some(u)) = (client_identity, upstream_identity) {
        kernel.register_session(c, u);
    }

    let stats = ConnectionResult::default();
    let result = copy::copy_bidirectional(client, upstream, &stats).await;

    if let (Some(c), Some(u)) = (client_identity, upstream_identity) {
        kernel.deregister_session(c, u);
    }

    metrics.tcp_sessions_total.inc();
    metrics
        .tcp_bytes_total
        .get_or_create(&DirectionLabel { protocol: "tcp", direction: "sent" })
        .inc_by(stats.sent());
    metrics
        .tcp_bytes_total
        .get_or_create(&DirectionLabel { protocol: "tcp", direction: "received" })
        .inc_by(stats.received());

    let duration = start.elapsed();
    match result {
        Ok(()) => {
            tracing::info!(
                remote = %remote_addr, upstream = upstream_addr,
                sent = stats.sent(), received = stats.received(),
                duration_ms = duration.as_millis() as u64,
                "tcp session closed"
            );
        }
        Err(e) => {
            let err: GatewayError = e.into();
            tracing::debug!(remote = %remote_addr, upstream = upstream_addr, error = %err, "tcp session ended with transport error");
        }
    }
}
