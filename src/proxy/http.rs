//! HTTP Proxy Handler (C4): serves one HTTP/1.1 exchange (or upgrade) from a sniffed
//! stream and forwards it to the configured upstream URL.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};

use crate::error::GatewayError;
use crate::metrics::{Metrics, StatusLabel};
use crate::policy::{PolicyEngine, RequestView};
use crate::proxy::copy::{self, ConnectionResult};
use crate::sniff::WrappedStream;

const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const GATEWAY_ID: &str = "ingress-gateway";

/// Trace-context headers this gateway knows to carry through even when the upstream
/// doesn't echo them back. The distributed-trace exporter itself is an external
/// collaborator (see spec.md §1); this crate's job is only to not drop the headers.
const TRACE_HEADERS: &[&str] = &["traceparent", "tracestate", "x-b3-traceid", "x-b3-spanid", "x-b3-sampled", "x-request-id"];

fn capture_trace_headers(headers: &http::HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    TRACE_HEADERS
        .iter()
        .copied()
        .filter_map(|name| {
            let value = headers.get(name)?.clone();
            Some((HeaderName::from_static(name), value))
        })
        .collect()
}

type OutboundBody = BoxBody<Bytes, hyper::Error>;
pub type OutboundClient = Client<HttpConnector, OutboundBody>;

pub fn build_client() -> OutboundClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

pub struct HttpProxyContext {
    pub policy: Arc<PolicyEngine>,
    pub metrics: Arc<Metrics>,
    pub client: OutboundClient,
    pub upstream_url: Uri,
    pub upstream_timeout: Duration,
}

/// Hop-by-hop headers per RFC 7230 §6.1, stripped when relaying in either direction.
/// `Connection` and `Upgrade` are preserved separately when the exchange is a protocol
/// upgrade.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
}

fn strip_hop_by_hop(headers: &mut http::HeaderMap, keep_upgrade: bool) {
    for name in HOP_BY_HOP {
        if keep_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }
}

fn text_body(s: &'static str) -> OutboundBody {
    Full::new(Bytes::from_static(s.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

fn deny_response(status: StatusCode, body: &'static str) -> Response<OutboundBody> {
    Response::builder().status(status).body(text_body(body)).unwrap()
}

/// Stamps the downstream response with whatever trace-context headers arrived on the
/// inbound request, so a trace started upstream of this gateway survives even a denied
/// or failed exchange (see spec.md §4.4).
fn with_trace_headers(mut resp: Response<OutboundBody>, trace_headers: &[(HeaderName, HeaderValue)]) -> Response<OutboundBody> {
    for (name, value) in trace_headers {
        resp.headers_mut().entry(name.clone()).or_insert_with(|| value.clone());
    }
    resp
}

/// Serves exactly one HTTP exchange (including any upgrade) from the sniffed stream,
/// then releases the connection. Errors are logged and swallowed; a single connection
/// failing never propagates past this task.
pub async fn handle(wrapped: WrappedStream, remote_addr: SocketAddr, ctx: Arc<HttpProxyContext>) {
    let io = TokioIo::new(wrapped);
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move {
            let mut resp = serve_one(req, remote_addr, ctx).await;
            // One exchange per sniffed connection (see spec.md Open Questions): tell the
            // client not to pipeline or reuse this socket, unless the exchange became an
            // upgrade, where "Connection" already carries the upgrade negotiation.
            if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
                resp.headers_mut()
                    .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
            }
            Ok::<_, std::convert::Infallible>(resp)
        }
    });

    let conn = http1::Builder::new()
        .half_close(true)
        .serve_connection(io, service)
        .with_upgrades();

    match tokio::time::timeout(READ_WRITE_TIMEOUT * 2, conn).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(remote = %remote_addr, error = %e, "http connection ended with error"),
        Err(_) => tracing::debug!(remote = %remote_addr, "http connection exceeded read/write timeout"),
    }
}

async fn serve_one(
    mut req: Request<Incoming>,
    remote_addr: SocketAddr,
    ctx: Arc<HttpProxyContext>,
) -> Response<OutboundBody> {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let raw_query = req.uri().query().unwrap_or("").to_string();

    let header_name = ctx.policy.auth_header_name();
    let header_subject = req
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let trace_headers = capture_trace_headers(req.headers());

    let view = RequestView {
        path: &path,
        raw_query: &raw_query,
        header_subject: header_subject.as_deref(),
        tls_subject: None, // this gateway never terminates TLS; see spec Non-goals.
    };

    if let Err(reason) = ctx.policy.authorize_http(&view) {
        let status = reason.http_status();
        ctx.policy.audit_http(
            remote_addr,
            &method,
            &path,
            Some(status.as_u16()),
            start.elapsed(),
            Some(reason.as_str().to_string()),
        );
        record_status(&ctx.metrics, status);
        return with_trace_headers(deny_response(status, "unauthorized"), &trace_headers);
    }
    if let Err((reason, detail)) = ctx.policy.apply_waf(remote_addr, &view) {
        let status = reason.http_status();
        ctx.policy.audit_http(remote_addr, &method, &path, Some(status.as_u16()), start.elapsed(), Some(detail));
        record_status(&ctx.metrics, status);
        return with_trace_headers(deny_response(status, "blocked by WAF"), &trace_headers);
    }

    let upgrade = is_upgrade_request(&req);
    let upgrade_on_req = if upgrade { Some(hyper::upgrade::on(&mut req)) } else { None };

    let outbound = match build_outbound_request(req, &ctx.upstream_url, upgrade) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "failed to build outbound request");
            ctx.policy
                .audit_http(remote_addr, &method, &path, Some(502), start.elapsed(), None);
            record_status(&ctx.metrics, StatusCode::BAD_GATEWAY);
            return with_trace_headers(deny_response(StatusCode::BAD_GATEWAY, "bad gateway"), &trace_headers);
        }
    };

    let response = tokio::time::timeout(ctx.upstream_timeout, ctx.client.request(outbound)).await;

    let mut upstream_resp = match response {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            let err = GatewayError::UpstreamUnavailable { detail: e.to_string() };
            tracing::debug!(remote = %remote_addr, error = %err, "upstream call failed");
            ctx.policy
                .audit_http(remote_addr, &method, &path, Some(502), start.elapsed(), None);
            record_status(&ctx.metrics, StatusCode::BAD_GATEWAY);
            return with_trace_headers(deny_response(err.http_status(), "bad gateway"), &trace_headers);
        }
        Err(_) => {
            let err = GatewayError::UpstreamUnavailable {
                detail: "upstream call timed out".to_string(),
            };
            tracing::debug!(remote = %remote_addr, error = %err, "upstream call timed out");
            ctx.policy
                .audit_http(remote_addr, &method, &path, Some(504), start.elapsed(), None);
            record_status(&ctx.metrics, StatusCode::GATEWAY_TIMEOUT);
            return with_trace_headers(deny_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout"), &trace_headers);
        }
    };

    let status = upstream_resp.status();
    record_status(&ctx.metrics, status);
    ctx.policy
        .audit_http(remote_addr, &method, &path, Some(status.as_u16()), start.elapsed(), None);
    ctx.metrics
        .http_request_duration_seconds
        .observe(start.elapsed().as_secs_f64());

    if upgrade && status == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(downstream_upgrade) = upgrade_on_req {
            let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
            let remote_addr_for_log = remote_addr;
            let metrics = ctx.metrics.clone();
            tokio::spawn(async move {
                match tokio::try_join!(downstream_upgrade, upstream_upgrade) {
                    Ok((downstream_io, upstream_io)) => {
                        let stats = ConnectionResult::default();
                        let result = copy::copy_bidirectional(
                            TokioIo::new(downstream_io),
                            TokioIo::new(upstream_io),
                            &stats,
                        )
                        .await;
                        metrics
                            .tcp_bytes_total
                            .get_or_create(&crate::metrics::DirectionLabel {
                                protocol: "http-upgrade",
                                direction: "sent",
                            })
                            .inc_by(stats.sent());
                        metrics
                            .tcp_bytes_total
                            .get_or_create(&crate::metrics::DirectionLabel {
                                protocol: "http-upgrade",
                                direction: "received",
                            })
                            .inc_by(stats.received());
                        if let Err(e) = result {
                            tracing::debug!(remote = %remote_addr_for_log, error = %e, "upgrade relay ended with error");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(remote = %remote_addr_for_log, error = %e, "upgrade handshake failed");
                    }
                }
            });
        }
    }

    let (mut parts, body) = upstream_resp.into_parts();
    strip_hop_by_hop(&mut parts.headers, upgrade);
    parts.headers.insert(
        HeaderName::from_static("x-gateway-id"),
        HeaderValue::from_static(GATEWAY_ID),
    );
    with_trace_headers(Response::from_parts(parts, body.boxed()), &trace_headers)
}

fn build_outbound_request(
    req: Request<Incoming>,
    upstream: &Uri,
    upgrade: bool,
) -> Result<Request<OutboundBody>, http::Error> {
    let (mut parts, body) = req.into_parts();

    let mut uri_parts = parts.uri.into_parts();
    uri_parts.scheme = upstream.scheme().cloned();
    uri_parts.authority = upstream.authority().cloned();
    parts.uri = Uri::from_parts(uri_parts).unwrap_or_else(|_| upstream.clone());

    strip_hop_by_hop(&mut parts.headers, upgrade);
    if let Some(authority) = upstream.authority() {
        if let Ok(host_value) = HeaderValue::from_str(authority.as_str()) {
            parts.headers.insert(http::header::HOST, host_value);
        }
    }

    let mut builder = Request::builder().method(parts.method).uri(parts.uri).version(parts.version);
    *builder.headers_mut().unwrap() = parts.headers;
    builder.body(body.boxed())
}

fn record_status(metrics: &Metrics, status: StatusCode) {
    metrics
        .http_requests_total
        .get_or_create(&StatusLabel { status: status.as_u16() })
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_upgrade_requests_case_insensitively() {
        let req = Request::builder()
            .header(http::header::CONNECTION, "Upgrade")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn strips_hop_by_hop_headers_but_keeps_others() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));

        strip_hop_by_hop(&mut headers, false);

        assert!(!headers.contains_key(http::header::CONNECTION));
        assert!(!headers.contains_key(http::header::TRANSFER_ENCODING));
        assert!(headers.contains_key(http::header::HOST));
    }

    #[test]
    fn strips_hop_by_hop_but_keeps_connection_and_upgrade_on_upgrade() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(http::header::TE, HeaderValue::from_static("trailers"));

        strip_hop_by_hop(&mut headers, true);

        assert!(headers.contains_key(http::header::CONNECTION));
        assert!(headers.contains_key(http::header::UPGRADE));
        assert!(!headers.contains_key(http::header::TE));
    }
}
