//! The audit sink: a single append-only, mutex-protected writer for fixed-schema JSON
//! lines. Distinct from application tracing (see `config::init_logging`) — this is the
//! compliance/analytics record, and write failures must never affect the data path.

use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: u64,
    protocol: &'a str,
    remote_addr: String,
    descriptor: String,
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

pub struct AuditSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AuditSink {
    pub fn stdout() -> Self {
        AuditSink {
            writer: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    fn write_line(&self, line: &str) {
        let mut guard = match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(guard, "{line}") {
            tracing::warn!(error = %e, "audit sink write failed");
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn http(
        &self,
        remote_addr: std::net::SocketAddr,
        method: &str,
        path: &str,
        action: &str,
        status: Option<u16>,
        duration_ms: Option<u64>,
        detail: Option<String>,
    ) {
        let record = AuditRecord {
            timestamp: Self::now_ms(),
            protocol: "http",
            remote_addr: remote_addr.to_string(),
            descriptor: format!("{method} {path}"),
            action,
            status,
            duration_ms,
            detail,
        };
        match serde_json::to_string(&record) {
            Ok(line) => self.write_line(&line),
            Err(e) => tracing::warn!(error = %e, "failed to serialize audit record"),
        }
    }

    pub fn tcp(
        &self,
        remote_addr: std::net::SocketAddr,
        upstream: &str,
        allowed: bool,
        detail: Option<String>,
    ) {
        let record = AuditRecord {
            timestamp: Self::now_ms(),
            protocol: "tcp",
            remote_addr: remote_addr.to_string(),
            descriptor: upstream.to_string(),
            action: if allowed { "allow" } else { "deny" },
            status: None,
            duration_ms: None,
            detail,
        };
        match serde_json::to_string(&record) {
            Ok(line) => self.write_line(&line),
            Err(e) => tracing::warn!(error = %e, "failed to serialize audit record"),
        }
    }
}
