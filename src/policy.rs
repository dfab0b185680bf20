//! Policy Engine (C2): holds the live security policy, evaluates admission, audits.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use regex::Regex;

use crate::audit::AuditSink;
use crate::error::DenyReason;
use crate::metrics::{DenyReasonLabel, Metrics, ProtocolLabel};
use crate::store::model::SecurityPolicy;

/// The immutable, atomically-swapped half of the policy: everything except the
/// rate-limit bucket's running state, which lives in its own small mutex (see
/// `RateLimiter`) so that bucket contention never blocks a policy-snapshot read.
#[derive(Clone)]
struct PolicySnapshot {
    auth_enabled: bool,
    header_subject: String,
    allowed_subjects: HashSet<String>,
    blocked_ips: HashSet<IpAddr>,
    compiled_patterns: Vec<Regex>,
}

impl PolicySnapshot {
    fn compile(policy: &SecurityPolicy) -> Self {
        PolicySnapshot {
            auth_enabled: policy.auth.enabled,
            header_subject: policy.auth.header_subject.clone(),
            allowed_subjects: policy.auth.allowed_subjects.clone(),
            blocked_ips: policy.blocked_ips.clone(),
            compiled_patterns: compile_patterns(&policy.blocked_patterns),
        }
    }
}

/// Compiles each pattern, logging and dropping (not failing) any that don't compile.
fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        match Regex::new(pattern) {
            Ok(re) => compiled.push(re),
            Err(e) => tracing::warn!(pattern, error = %e, "dropping uncompilable WAF pattern"),
        }
    }
    compiled
}

struct RateLimiterState {
    enabled: bool,
    rps: f64,
    burst: u64,
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with continuous monotonic-time refill, guarded by a single mutex.
/// Contention is bounded by `rps`, so coarse locking is sufficient (no lock-free CAS
/// machinery is needed here).
struct RateLimiter(std::sync::Mutex<RateLimiterState>);

impl RateLimiter {
    fn new() -> Self {
        RateLimiter(std::sync::Mutex::new(RateLimiterState {
            enabled: false,
            rps: 0.0,
            burst: 0,
            tokens: 0.0,
            last_refill: Instant::now(),
        }))
    }

    fn replace(&self, enabled: bool, rps: f64, burst: u64) {
        let mut state = self.0.lock().unwrap();
        state.enabled = enabled;
        state.rps = rps;
        state.burst = burst;
        state.tokens = burst as f64;
        state.last_refill = Instant::now();
    }

    /// Returns true and consumes one token iff a token is available. `rps <= 0` or
    /// `burst <= 0` disables the limiter (always allow).
    fn allow(&self) -> bool {
        let mut state = self.0.lock().unwrap();
        if !state.enabled || state.rps <= 0.0 || state.burst == 0 {
            return true;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * state.rps).min(state.burst as f64);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Minimal view of an HTTP request the engine needs for `authorize_http`/`apply_waf`,
/// decoupled from any particular HTTP library type.
pub struct RequestView<'a> {
    pub path: &'a str,
    pub raw_query: &'a str,
    pub header_subject: Option<&'a str>,
    pub tls_subject: Option<&'a str>,
}

pub struct PolicyEngine {
    snapshot: ArcSwap<PolicySnapshot>,
    rate_limiter: RateLimiter,
    audit: Arc<AuditSink>,
    metrics: Arc<Metrics>,
}

impl PolicyEngine {
    pub fn new(initial: SecurityPolicy, audit: Arc<AuditSink>, metrics: Arc<Metrics>) -> Self {
        let engine = PolicyEngine {
            snapshot: ArcSwap::from_pointee(PolicySnapshot::compile(&initial)),
            rate_limiter: RateLimiter::new(),
            audit,
            metrics,
        };
        engine
            .rate_limiter
            .replace(initial.rate_limit.enabled, initial.rate_limit.rps, initial.rate_limit.burst);
        engine
    }

    fn record_deny(&self, reason: DenyReason) {
        self.metrics
            .policy_denies_total
            .get_or_create(&DenyReasonLabel {
                reason: reason.as_str().to_string(),
            })
            .inc();
    }

    /// Called once per accepted connection before dispatch. IP deny first, rate limit
    /// second; on deny, no token is consumed.
    pub fn check_connection(&self, remote_addr: SocketAddr) -> Result<(), DenyReason> {
        let snapshot = self.snapshot.load();
        if snapshot.blocked_ips.contains(&remote_addr.ip()) {
            self.record_deny(DenyReason::WafBlockedIp);
            return Err(DenyReason::WafBlockedIp);
        }
        if !self.rate_limiter.allow() {
            self.record_deny(DenyReason::RateLimitExceeded);
            return Err(DenyReason::RateLimitExceeded);
        }
        Ok(())
    }

    /// The header name currently configured as the auth subject fallback source.
    pub fn auth_header_name(&self) -> String {
        self.snapshot.load().header_subject.clone()
    }

    /// Called per HTTP request after sniffing.
    pub fn authorize_http(&self, req: &RequestView) -> Result<(), DenyReason> {
        let snapshot = self.snapshot.load();
        if !snapshot.auth_enabled {
            return Ok(());
        }
        let subject = req.tls_subject.or(req.header_subject);
        let subject = match subject {
            Some(s) if !s.is_empty() => s,
            _ => {
                self.record_deny(DenyReason::AuthMissingSubject);
                return Err(DenyReason::AuthMissingSubject);
            }
        };
        if snapshot.allowed_subjects.is_empty() || snapshot.allowed_subjects.contains(subject) {
            Ok(())
        } else {
            self.record_deny(DenyReason::AuthUnauthorized);
            Err(DenyReason::AuthUnauthorized)
        }
    }

    /// Re-checks IP (in case the TCP-level check was skipped) and evaluates each regex
    /// against `path + "?" + raw_query`. First match denies. The `Err` carries the
    /// specific offending detail (the blocked IP or the matched pattern) alongside the
    /// reason, so the audit record can name exactly what triggered the deny (§8 scenario 2
    /// requires the matched pattern text to appear in the record).
    pub fn apply_waf(&self, remote_addr: SocketAddr, req: &RequestView) -> Result<(), (DenyReason, String)> {
        let snapshot = self.snapshot.load();
        if snapshot.blocked_ips.contains(&remote_addr.ip()) {
            self.record_deny(DenyReason::WafBlockedIp);
            return Err((DenyReason::WafBlockedIp, format!("blocked IP: {}", remote_addr.ip())));
        }
        let target = if req.raw_query.is_empty() {
            req.path.to_string()
        } else {
            format!("{}?{}", req.path, req.raw_query)
        };
        for pattern in &snapshot.compiled_patterns {
            if pattern.is_match(&target) {
                self.record_deny(DenyReason::WafPatternMatch);
                return Err((DenyReason::WafPatternMatch, pattern.as_str().to_string()));
            }
        }
        Ok(())
    }

    /// `deny_detail` is the fully-formed deny-reason string for the audit record (e.g.
    /// the matched WAF pattern, or a plain reason label for non-pattern denies); `None`
    /// means the exchange was allowed.
    pub fn audit_http(
        &self,
        remote_addr: SocketAddr,
        method: &str,
        path: &str,
        status: Option<u16>,
        duration: Duration,
        deny_detail: Option<String>,
    ) {
        let action = if deny_detail.is_some() { "deny" } else { "allow" };
        self.metrics
            .connections_total
            .get_or_create(&ProtocolLabel {
                protocol: crate::metrics::Protocol::Http,
            })
            .inc();
        self.audit.http(
            remote_addr,
            method,
            path,
            action,
            status,
            Some(duration.as_millis() as u64),
            deny_detail,
        );
    }

    pub fn audit_tcp(&self, remote_addr: SocketAddr, upstream: &str, allowed: bool, detail: Option<String>) {
        self.metrics
            .connections_total
            .get_or_create(&ProtocolLabel {
                protocol: crate::metrics::Protocol::Tcp,
            })
            .inc();
        self.audit.tcp(remote_addr, upstream, allowed, detail);
    }

    // --- update surface, called by the reload consumer ---

    /// Replaces the whole security policy atomically. Reload-all, per C1's hint design.
    pub fn reload(&self, policy: &SecurityPolicy) {
        self.snapshot.store(Arc::new(PolicySnapshot::compile(policy)));
        self.rate_limiter
            .replace(policy.rate_limit.enabled, policy.rate_limit.rps, policy.rate_limit.burst);
    }

    pub fn replace_rate_limit(&self, rps: f64, burst: u64) {
        self.rate_limiter.replace(true, rps, burst);
    }

    pub fn disable_rate_limit(&self) {
        self.rate_limiter.replace(false, 0.0, 0);
    }

    /// Swaps in a new IP deny set, leaving every other section of the policy untouched.
    pub fn replace_blocked_ips(&self, ips: HashSet<IpAddr>) {
        let current = self.snapshot.load();
        let mut next = (**current).clone();
        next.blocked_ips = ips;
        self.snapshot.store(Arc::new(next));
    }

    /// Recompiles and swaps in a new WAF pattern set; patterns that fail to compile are
    /// dropped with a warning rather than rejecting the whole update.
    pub fn replace_blocked_patterns(&self, patterns: &[String]) {
        let current = self.snapshot.load();
        let mut next = (**current).clone();
        next.compiled_patterns = compile_patterns(patterns);
        self.snapshot.store(Arc::new(next));
    }

    /// Swaps in a new allowed-subjects set; an empty set means "allow any authenticated
    /// subject", per §3.
    pub fn replace_allowed_subjects(&self, subjects: HashSet<String>) {
        let current = self.snapshot.load();
        let mut next = (**current).clone();
        next.allowed_subjects = subjects;
        self.snapshot.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn metrics_and_audit() -> (Arc<Metrics>, Arc<AuditSink>) {
        let mut registry = prometheus_client::registry::Registry::default();
        (Arc::new(Metrics::new(&mut registry)), Arc::new(AuditSink::stdout()))
    }

    #[test]
    fn rate_limiter_respects_burst() {
        let limiter = RateLimiter::new();
        limiter.replace(true, 1.0, 2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn rate_limiter_disabled_always_allows() {
        let limiter = RateLimiter::new();
        limiter.replace(false, 0.0, 0);
        for _ in 0..10 {
            assert!(limiter.allow());
        }
    }

    #[test]
    fn rate_limiter_refills_over_time() {
        let limiter = RateLimiter::new();
        limiter.replace(true, 100.0, 1);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        sleep(Duration::from_millis(20));
        assert!(limiter.allow());
    }

    #[test]
    fn ip_deny_precedes_rate_limit() {
        let (metrics, audit) = metrics_and_audit();
        let mut policy = SecurityPolicy::default();
        policy.blocked_ips.insert("10.0.0.1".parse().unwrap());
        policy.rate_limit = crate::store::model::RateLimitPolicy {
            enabled: true,
            rps: 1000.0,
            burst: 1000,
        };
        let engine = PolicyEngine::new(policy, audit, metrics);
        let addr: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(engine.check_connection(addr), Err(DenyReason::WafBlockedIp));
    }

    #[test]
    fn waf_pattern_match_denies() {
        let (metrics, audit) = metrics_and_audit();
        let mut policy = SecurityPolicy::default();
        policy.blocked_patterns.push("(?i)(union.*select)".to_string());
        let engine = PolicyEngine::new(policy, audit, metrics);
        let req = RequestView {
            path: "/x",
            raw_query: "q=UNION%20SELECT%201",
            header_subject: None,
            tls_subject: None,
        };
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(
            engine.apply_waf(addr, &req),
            Err((DenyReason::WafPatternMatch, "(?i)(union.*select)".to_string()))
        );
    }

    #[test]
    fn bad_pattern_is_dropped_not_fatal() {
        let (metrics, audit) = metrics_and_audit();
        let mut policy = SecurityPolicy::default();
        policy.blocked_patterns.push("(unterminated".to_string());
        let engine = PolicyEngine::new(policy, audit, metrics);
        let req = RequestView {
            path: "/ok",
            raw_query: "",
            header_subject: None,
            tls_subject: None,
        };
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(engine.apply_waf(addr, &req), Ok(()));
    }

    #[test]
    fn auth_empty_allowed_set_accepts_any_subject() {
        let (metrics, audit) = metrics_and_audit();
        let mut policy = SecurityPolicy::default();
        policy.auth.enabled = true;
        let engine = PolicyEngine::new(policy, audit, metrics);
        let req = RequestView {
            path: "/",
            raw_query: "",
            header_subject: Some("anyone"),
            tls_subject: None,
        };
        assert_eq!(engine.authorize_http(&req), Ok(()));
    }

    #[test]
    fn auth_missing_subject_denies() {
        let (metrics, audit) = metrics_and_audit();
        let mut policy = SecurityPolicy::default();
        policy.auth.enabled = true;
        let engine = PolicyEngine::new(policy, audit, metrics);
        let req = RequestView {
            path: "/",
            raw_query: "",
            header_subject: None,
            tls_subject: None,
        };
        assert_eq!(engine.authorize_http(&req), Err(DenyReason::AuthMissingSubject));
    }

    #[test]
    fn replace_blocked_ips_takes_effect_without_touching_auth() {
        let (metrics, audit) = metrics_and_audit();
        let mut policy = SecurityPolicy::default();
        policy.auth.enabled = true;
        policy.auth.allowed_subjects.insert("alice".to_string());
        let engine = PolicyEngine::new(policy, audit, metrics);

        let addr: SocketAddr = "10.0.0.9:1".parse().unwrap();
        assert_eq!(engine.check_connection(addr), Ok(()));

        let mut ips = HashSet::new();
        ips.insert("10.0.0.9".parse().unwrap());
        engine.replace_blocked_ips(ips);

        assert_eq!(engine.check_connection(addr), Err(DenyReason::WafBlockedIp));
        let req = RequestView {
            path: "/",
            raw_query: "",
            header_subject: Some("alice"),
            tls_subject: None,
        };
        assert_eq!(engine.authorize_http(&req), Ok(()));
    }

    #[test]
    fn replace_blocked_patterns_drops_bad_ones_and_keeps_good_ones() {
        let (metrics, audit) = metrics_and_audit();
        let engine = PolicyEngine::new(SecurityPolicy::default(), audit, metrics);
        engine.replace_blocked_patterns(&["(unterminated".to_string(), "(?i)drop.*table".to_string()]);

        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let blocked = RequestView {
            path: "/x",
            raw_query: "q=DROP%20TABLE%20users",
            header_subject: None,
            tls_subject: None,
        };
        assert_eq!(
            engine.apply_waf(addr, &blocked),
            Err((DenyReason::WafPatternMatch, "(?i)drop.*table".to_string()))
        );
    }

    #[test]
    fn replace_allowed_subjects_narrows_access() {
        let (metrics, audit) = metrics_and_audit();
        let mut policy = SecurityPolicy::default();
        policy.auth.enabled = true;
        let engine = PolicyEngine::new(policy, audit, metrics);

        let mut subjects = HashSet::new();
        subjects.insert("bob".to_string());
        engine.replace_allowed_subjects(subjects);

        let req = RequestView {
            path: "/",
            raw_query: "",
            header_subject: Some("eve"),
            tls_subject: None,
        };
        assert_eq!(engine.authorize_http(&req), Err(DenyReason::AuthUnauthorized));
    }
}
