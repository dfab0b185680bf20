use std::collections::HashSet;
use std::time::Duration;

/// Business configuration: loaded once at startup, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct BusinessConfig {
    pub listen_addr: String,
    pub max_connections: Option<u64>,
    pub http_target_url: String,
    pub http_timeout: Duration,
    pub tcp_target_addr: String,
    pub tcp_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub drain_wait_time: Duration,
}

/// Security policy: mutable, hot-reloaded as a whole via the pub/sub channel.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    pub auth: AuthPolicy,
    pub rate_limit: RateLimitPolicy,
    pub blocked_ips: HashSet<std::net::IpAddr>,
    pub blocked_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    pub enabled: bool,
    pub header_subject: String,
    pub allowed_subjects: HashSet<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub rps: f64,
    pub burst: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        RateLimitPolicy {
            enabled: false,
            rps: 0.0,
            burst: 0,
        }
    }
}

/// A hint delivered on the `{prefix}config:changed` channel. The consumer reloads the
/// full security policy on any hint rather than diff-applying it.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PolicyUpdateHint {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}
