use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum Protocol {
    Http,
    Tcp,
    HttpUpgrade,
    Unknown,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabel {
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DenyReasonLabel {
    pub reason: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: u16,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DirectionLabel {
    pub protocol: &'static str,
    pub direction: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabel {
    pub result: &'static str,
}

pub struct Metrics {
    pub connections_total: Family<ProtocolLabel, Counter>,
    pub policy_denies_total: Family<DenyReasonLabel, Counter>,
    pub tcp_bytes_total: Family<DirectionLabel, Counter>,
    pub tcp_sessions_total: Counter,
    pub http_requests_total: Family<StatusLabel, Counter>,
    pub http_request_duration_seconds: Histogram,
    pub kernel_redirect_active: Gauge,
    pub config_store_reload_total: Family<ResultLabel, Counter>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let connections_total = Family::default();
        registry.register(
            "connections_total",
            "Accepted connections by protocol",
            connections_total.clone(),
        );

        let policy_denies_total = Family::default();
        registry.register(
            "policy_denies_total",
            "Policy Engine deny outcomes by reason",
            policy_denies_total.clone(),
        );

        let tcp_bytes_total = Family::default();
        registry.register(
            "tcp_bytes_total",
            "Bytes relayed by the TCP splicer by direction",
            tcp_bytes_total.clone(),
        );

        let tcp_sessions_total = Counter::default();
        registry.register(
            "tcp_sessions_total",
            "Completed TCP splice sessions",
            tcp_sessions_total.clone(),
        );

        let http_requests_total = Family::default();
        registry.register(
            "http_requests_total",
            "Proxied HTTP exchanges by response status",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds = Histogram::new(
            [0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0].into_iter(),
        );
        registry.register(
            "http_request_duration_seconds",
            "HTTP proxy exchange duration",
            http_request_duration_seconds.clone(),
        );

        let kernel_redirect_active = Gauge::default();
        registry.register(
            "kernel_redirect_active",
            "Whether kernel socket-redirect acceleration is active (0/1)",
            kernel_redirect_active.clone(),
        );

        let config_store_reload_total = Family::default();
        registry.register(
            "config_store_reload_total",
            "Security policy reload attempts by result",
            config_store_reload_total.clone(),
        );

        Metrics {
            connections_total,
            policy_denies_total,
            tcp_bytes_total,
            tcp_sessions_total,
            http_requests_total,
            http_request_duration_seconds,
            kernel_redirect_active,
            config_store_reload_total,
        }
    }
}
