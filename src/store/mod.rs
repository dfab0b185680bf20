//! Config Store Client (C1): connects to an external Redis-compatible key-value/pub-sub
//! service, loads business config once at startup, loads and streams security policy.

pub mod model;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub use model::{AuthPolicy, BusinessConfig, PolicyUpdateHint, RateLimitPolicy, SecurityPolicy};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("required field missing: {0}")]
    MissingField(String),
    #[error("store unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_business(&self) -> Result<BusinessConfig, StoreError>;
    async fn load_security(&self) -> SecurityPolicy;
    async fn health(&self) -> Result<(), StoreError>;
}

/// Redis-backed implementation. `{prefix}` defaults to `gateway:`.
pub struct RedisConfigStore {
    client: redis::Client,
    conn: tokio::sync::Mutex<ConnectionManager>,
    prefix: String,
}

impl RedisConfigStore {
    pub async fn connect(url: &str, prefix: String) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Unreachable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(RedisConfigStore {
            client,
            conn: tokio::sync::Mutex::new(conn),
            prefix,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// Subscribes to `{prefix}config:changed` and returns a lazy sequence of hints.
    /// Each subscribe failure is retried with backoff; the caller reloads the full
    /// security policy on every hint received.
    pub async fn updates(&self) -> Result<impl futures_util::Stream<Item = PolicyUpdateHint>, StoreError> {
        let channel = self.key("config:changed");
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str::<PolicyUpdateHint>(&payload).ok()
        });
        Ok(stream)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.lock().await;
        conn.hgetall(key)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.conn.lock().await;
        conn.smembers(key)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }

    fn parse_duration(raw: &str, field: &str) -> Result<Duration, StoreError> {
        duration_str::parse(raw).map_err(|_| StoreError::MissingField(field.to_string()))
    }

    fn parse_bool(raw: &str) -> bool {
        matches!(raw, "true" | "1")
    }
}

#[async_trait]
impl ConfigStore for RedisConfigStore {
    async fn load_business(&self) -> Result<BusinessConfig, StoreError> {
        let fields = self.hgetall(&self.key("business:config")).await?;
        if fields.is_empty() {
            return Err(StoreError::MissingField(
                "business:config is empty or absent".to_string(),
            ));
        }

        let get = |name: &str| -> Result<String, StoreError> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::MissingField(name.to_string()))
        };

        let listen_addr = get("server.listen_addr")?;
        let tcp_target_addr = get("backends.tcp.target_addr")?;
        let http_target_url = get("backends.http.target_url")?;

        let max_connections = fields
            .get("max_connections")
            .and_then(|v| v.parse::<u64>().ok());
        let http_timeout = fields
            .get("backends.http.timeout")
            .map(|v| Self::parse_duration(v, "backends.http.timeout"))
            .transpose()?
            .unwrap_or(Duration::from_secs(30));
        let tcp_timeout = fields
            .get("backends.tcp.timeout")
            .map(|v| Self::parse_duration(v, "backends.tcp.timeout"))
            .transpose()?
            .unwrap_or(Duration::from_secs(5));
        let shutdown_timeout = fields
            .get("lifecycle.shutdown_timeout")
            .map(|v| Self::parse_duration(v, "lifecycle.shutdown_timeout"))
            .transpose()?
            .unwrap_or(Duration::from_secs(30));
        let drain_wait_time = fields
            .get("lifecycle.drain_wait_time")
            .map(|v| Self::parse_duration(v, "lifecycle.drain_wait_time"))
            .transpose()?
            .unwrap_or(Duration::from_secs(5));

        Ok(BusinessConfig {
            listen_addr,
            max_connections,
            http_target_url,
            http_timeout,
            tcp_target_addr,
            tcp_timeout,
            shutdown_timeout,
            drain_wait_time,
        })
    }

    async fn load_security(&self) -> SecurityPolicy {
        let auth_key = self.key("auth:config");
        let auth_fields = self.hgetall(&auth_key).await.unwrap_or_else(|e| {
            tracing::warn!(key = %auth_key, error = %e, "failed to load auth config, using defaults");
            HashMap::new()
        });
        let rate_key = self.key("rate_limit");
        let rate_fields = self.hgetall(&rate_key).await.unwrap_or_else(|e| {
            tracing::warn!(key = %rate_key, error = %e, "failed to load rate limit config, using defaults");
            HashMap::new()
        });
        let waf_key = self.key("waf:config");
        let waf_fields = self.hgetall(&waf_key).await.unwrap_or_else(|e| {
            tracing::warn!(key = %waf_key, error = %e, "failed to load WAF config, using defaults");
            HashMap::new()
        });
        let allowed_subjects_key = self.key("auth:allowed_subjects");
        let allowed_subjects = self.smembers(&allowed_subjects_key).await.unwrap_or_else(|e| {
            tracing::warn!(key = %allowed_subjects_key, error = %e, "failed to load allowed subjects, using defaults");
            HashSet::new()
        });
        let blocked_ips_key = self.key("waf:blocked_ips");
        let blocked_ips_raw = self.smembers(&blocked_ips_key).await.unwrap_or_else(|e| {
            tracing::warn!(key = %blocked_ips_key, error = %e, "failed to load blocked IPs, using defaults");
            HashSet::new()
        });
        let blocked_patterns_key = self.key("waf:blocked_patterns");
        let blocked_patterns_raw = self.smembers(&blocked_patterns_key).await.unwrap_or_else(|e| {
            tracing::warn!(key = %blocked_patterns_key, error = %e, "failed to load blocked patterns, using defaults");
            HashSet::new()
        });

        let waf_enabled = waf_fields
            .get("enabled")
            .map(|v| Self::parse_bool(v))
            .unwrap_or(true);

        let blocked_ips: HashSet<IpAddr> = if waf_enabled {
            blocked_ips_raw
                .iter()
                .filter_map(|s| s.parse::<IpAddr>().ok())
                .collect()
        } else {
            HashSet::new()
        };
        let blocked_patterns: Vec<String> = if waf_enabled {
            blocked_patterns_raw.into_iter().collect()
        } else {
            Vec::new()
        };

        let rate_limit = RateLimitPolicy {
            enabled: rate_fields
                .get("enabled")
                .map(|v| Self::parse_bool(v))
                .unwrap_or(false),
            rps: rate_fields
                .get("rps")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
            burst: rate_fields
                .get("burst")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
        };

        let auth = AuthPolicy {
            enabled: auth_fields
                .get("enabled")
                .map(|v| Self::parse_bool(v))
                .unwrap_or(false),
            header_subject: auth_fields
                .get("header_subject")
                .cloned()
                .unwrap_or_else(|| "X-Forwarded-Subject".to_string()),
            allowed_subjects,
        };

        SecurityPolicy {
            auth,
            rate_limit,
            blocked_ips,
            blocked_patterns,
        }
    }

    async fn health(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_true_and_one() {
        assert!(RedisConfigStore::parse_bool("true"));
        assert!(RedisConfigStore::parse_bool("1"));
        assert!(!RedisConfigStore::parse_bool("false"));
        assert!(!RedisConfigStore::parse_bool("0"));
        assert!(!RedisConfigStore::parse_bool("garbage"));
    }

    #[test]
    fn parse_duration_accepts_human_readable_strings() {
        assert_eq!(
            RedisConfigStore::parse_duration("30s", "f").unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            RedisConfigStore::parse_duration("1h", "f").unwrap(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(RedisConfigStore::parse_duration("not-a-duration", "some_field").is_err());
    }
}
