use http::StatusCode;

/// The kinds from the error taxonomy. Each carries just enough context to log and,
/// where applicable, map to an HTTP status or an audit-deny record.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("fatal startup error: {0}")]
    FatalStartup(String),

    #[error("policy denied: {reason}")]
    PolicyDeny { reason: DenyReason },

    #[error("upstream unavailable: {detail}")]
    UpstreamUnavailable { detail: String },

    #[error("client transport error: {0}")]
    ClientTransport(#[source] std::io::Error),

    #[error("upstream transport error: {0}")]
    UpstreamTransport(#[source] std::io::Error),

    #[error("kernel acceleration degraded: {0}")]
    KernelDegraded(String),

    #[error("config store transient error: {0}")]
    ConfigStoreTransient(String),

    #[error("audit sink error: {0}")]
    AuditSinkError(String),
}

/// Deny reasons surfaced by the Policy Engine, per the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    WafBlockedIp,
    RateLimitExceeded,
    WafPatternMatch,
    AuthMissingSubject,
    AuthUnauthorized,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::WafBlockedIp => "blocked IP",
            DenyReason::RateLimitExceeded => "rate limit exceeded",
            DenyReason::WafPatternMatch => "WAF pattern match",
            DenyReason::AuthMissingSubject => "auth: missing subject",
            DenyReason::AuthUnauthorized => "auth: unauthorized subject",
        }
    }

    /// HTTP status this reason maps to when surfaced over the HTTP proxy path.
    pub fn http_status(&self) -> StatusCode {
        match self {
            DenyReason::AuthMissingSubject | DenyReason::AuthUnauthorized => {
                StatusCode::UNAUTHORIZED
            }
            DenyReason::WafBlockedIp | DenyReason::WafPatternMatch => StatusCode::FORBIDDEN,
            DenyReason::RateLimitExceeded => StatusCode::FORBIDDEN,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GatewayError {
    /// Whether this outcome should produce an audit `action=deny` record.
    pub fn is_audit_deny(&self) -> bool {
        matches!(self, GatewayError::PolicyDeny { .. })
    }

    /// The §7 propagation policy's HTTP mapping. Only `PolicyDeny` is surfaced to the
    /// client as anything but a generic gateway failure; transport and transient-store
    /// errors are recovered locally and never reach this call site on a successful
    /// exchange, but a handler that does reach here maps them to the closest bad-gateway
    /// status rather than leaking transport detail to the client.
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::PolicyDeny { reason } => reason.http_status(),
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<crate::proxy::copy::CopyError> for GatewayError {
    fn from(e: crate::proxy::copy::CopyError) -> Self {
        match e {
            crate::proxy::copy::CopyError::Client(e) => GatewayError::ClientTransport(e),
            crate::proxy::copy::CopyError::Upstream(e) => GatewayError::UpstreamTransport(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_reasons_map_to_401() {
        assert_eq!(DenyReason::AuthMissingSubject.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenyReason::AuthUnauthorized.http_status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn waf_reasons_map_to_403() {
        assert_eq!(DenyReason::WafBlockedIp.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(DenyReason::WafPatternMatch.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(DenyReason::RateLimitExceeded.http_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn only_policy_deny_is_audit_deny() {
        assert!(GatewayError::PolicyDeny { reason: DenyReason::WafBlockedIp }.is_audit_deny());
        assert!(!GatewayError::KernelDegraded("x".into()).is_audit_deny());
        assert!(!GatewayError::AuditSinkError("x".into()).is_audit_deny());
    }

    #[test]
    fn policy_deny_http_status_delegates_to_reason() {
        let err = GatewayError::PolicyDeny { reason: DenyReason::RateLimitExceeded };
        assert_eq!(err.http_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn non_deny_errors_map_to_bad_gateway() {
        assert_eq!(
            GatewayError::UpstreamUnavailable { detail: "x".into() }.http_status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn copy_error_converts_to_matching_transport_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: GatewayError = crate::proxy::copy::CopyError::Client(io_err).into();
        assert!(matches!(err, GatewayError::ClientTransport(_)));
    }
}
