pub mod copy;
pub mod http;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::Instrument;

use crate::kernel::KernelRedirector;
use crate::metrics::Metrics;
use crate::policy::PolicyEngine;
use crate::sniff::{self, ProtocolKind};

pub struct Dispatcher {
    pub policy: Arc<PolicyEngine>,
    pub metrics: Arc<Metrics>,
    pub kernel: Arc<dyn KernelRedirector>,
    pub tcp_upstream: String,
    pub http_ctx: Arc<http::HttpProxyContext>,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Runs the per-connection admission, sniff, and dispatch sequence described in §3 Data
/// flow, inside a span carrying the remote address and an assigned connection id so every
/// sniff/policy/dial/splice event downstream can be correlated back to this connection.
/// Ownership of the accepted socket moves into this task for its whole lifetime.
pub async fn dispatch(dispatcher: Arc<Dispatcher>, stream: TcpStream, remote_addr: SocketAddr) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!("connection", conn_id, remote = %remote_addr);
    dispatch_inner(dispatcher, stream, remote_addr).instrument(span).await
}

async fn dispatch_inner(dispatcher: Arc<Dispatcher>, stream: TcpStream, remote_addr: SocketAddr) {
    if let Err(reason) = dispatcher.policy.check_connection(remote_addr) {
        tracing::debug!(remote = %remote_addr, reason = %reason, "connection denied at admission");
        let detail = match reason {
            crate::error::DenyReason::WafBlockedIp => format!("blocked IP: {}", remote_addr.ip()),
            other => other.to_string(),
        };
        dispatcher.policy.audit_tcp(remote_addr, "", false, Some(detail));
        return;
    }

    let (kind, wrapped) = sniff::classify(stream).await;
    match kind {
        ProtocolKind::Http => {
            http::handle(wrapped, remote_addr, dispatcher.http_ctx.clone()).await;
        }
        ProtocolKind::OpaqueTcp => {
            tcp::handle(
                wrapped,
                remote_addr,
                &dispatcher.tcp_upstream,
                &dispatcher.policy,
                &dispatcher.metrics,
                &dispatcher.kernel,
            )
            .await;
        }
        ProtocolKind::Tls => {
            tracing::debug!(remote = %remote_addr, "TLS connection received; no TLS handler configured, closing");
        }
        ProtocolKind::Unknown => {
            tracing::debug!(remote = %remote_addr, "connection classified as unknown, closing");
        }
    }
}
