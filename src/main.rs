//! Process entrypoint. Wires the six components from §2 together: connects the config
//! store, loads business config (fatal if absent) and the initial security policy,
//! builds the policy engine, proxy handlers and kernel redirector, then hands off to the
//! Lifecycle Controller for the accept loop and shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use http::Uri;
use prometheus_client::registry::Registry;
use rand::Rng;
use tokio::sync::watch;

use ingress_gateway::audit::AuditSink;
use ingress_gateway::config::{self, GatewayArgs};
use ingress_gateway::drain::DrainState;
use ingress_gateway::error::GatewayError;
use ingress_gateway::kernel;
use ingress_gateway::lifecycle::{self, ShutdownPlan};
use ingress_gateway::management;
use ingress_gateway::metrics::{Metrics, ResultLabel};
use ingress_gateway::policy::PolicyEngine;
use ingress_gateway::proxy::http::{self, HttpProxyContext};
use ingress_gateway::proxy::Dispatcher;
use ingress_gateway::signal;
use ingress_gateway::store::{ConfigStore, RedisConfigStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = GatewayArgs::parse();
    config::init_logging();

    let store = Arc::new(
        RedisConfigStore::connect(&args.store_url, args.store_prefix.clone())
            .await
            .context("connecting to the external config store")?,
    );

    let business = store.load_business().await.map_err(|e| {
        tracing::error!(error = %e, "fatal startup error: business config unavailable");
        anyhow::anyhow!("business config load failed: {e}")
    })?;
    let security = store.load_security().await;

    tracing::info!(
        listen_addr = %business.listen_addr,
        http_target = %business.http_target_url,
        tcp_target = %business.tcp_target_addr,
        auth_enabled = security.auth.enabled,
        rate_limit_enabled = security.rate_limit.enabled,
        blocked_ips = security.blocked_ips.len(),
        blocked_patterns = security.blocked_patterns.len(),
        "loaded business config and initial security policy"
    );

    if args.dry_run {
        tracing::info!("dry run complete, exiting without binding a listener");
        return Ok(());
    }

    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::new(&mut registry));
    let audit = Arc::new(AuditSink::stdout());
    let policy = Arc::new(PolicyEngine::new(security, audit, metrics.clone()));

    let kernel_redirector: Arc<dyn kernel::KernelRedirector> =
        Arc::from(kernel::try_init(args.enable_kernel_redirect));
    metrics
        .kernel_redirect_active
        .set(if kernel_redirector.is_active() { 1i64 } else { 0i64 });

    let upstream_url: Uri = business
        .http_target_url
        .parse()
        .with_context(|| format!("parsing backends.http.target_url {:?}", business.http_target_url))?;

    let http_ctx = Arc::new(HttpProxyContext {
        policy: policy.clone(),
        metrics: metrics.clone(),
        client: http::build_client(),
        upstream_url,
        upstream_timeout: business.http_timeout,
    });

    let dispatcher = Arc::new(Dispatcher {
        policy: policy.clone(),
        metrics: metrics.clone(),
        kernel: kernel_redirector,
        tcp_upstream: business.tcp_target_addr.clone(),
        http_ctx,
    });

    let listen_addr: SocketAddr = args
        .listen_addr
        .as_deref()
        .unwrap_or(&business.listen_addr)
        .parse()
        .context("parsing listen address")?;

    let drain = DrainState::new();
    let (_shutdown_trigger, shutdown) = signal::shutdown_handle();
    let (mgmt_shutdown_tx, mgmt_shutdown_rx) = watch::channel(false);

    let store_dyn: Arc<dyn ConfigStore> = store.clone();
    let mgmt_handle = tokio::spawn(management::serve(
        args.mgmt_addr.parse().context("parsing management bind address")?,
        registry,
        drain.clone(),
        Some(store_dyn.clone()),
        mgmt_shutdown_rx,
    ));

    let reload_handle = tokio::spawn(run_reload_loop(store.clone(), policy.clone(), metrics.clone()));

    let plan = ShutdownPlan {
        shutdown_timeout: business.shutdown_timeout,
    };

    let result = lifecycle::run(
        listen_addr,
        dispatcher,
        drain,
        shutdown,
        plan,
        mgmt_shutdown_tx,
        store_dyn,
    )
    .await;

    reload_handle.abort();
    match mgmt_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "management server exited with error"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::warn!(error = %e, "management server task panicked"),
    }

    // Step 7 of the shutdown sequence: close the config store client last, once nothing
    // else (the management server's readiness probe, the reload loop) still needs it.
    drop(store);

    result
}

/// Subscribes to `{prefix}config:changed` and reloads the full security policy on every
/// hint. A subscribe failure (transient store error) is logged as a warning and retried
/// with jittered exponential backoff, per §4.1's failure semantics: it never aborts the
/// process and always leaves the last-known policy in place until a reload succeeds.
async fn run_reload_loop(store: Arc<RedisConfigStore>, policy: Arc<PolicyEngine>, metrics: Arc<Metrics>) {
    const MIN_BACKOFF: Duration = Duration::from_millis(500);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    let mut backoff = MIN_BACKOFF;
    loop {
        match store.updates().await {
            Ok(mut stream) => {
                backoff = MIN_BACKOFF;
                while let Some(hint) = stream.next().await {
                    let policy_data = store.load_security().await;
                    policy.reload(&policy_data);
                    metrics
                        .config_store_reload_total
                        .get_or_create(&ResultLabel { result: "ok" })
                        .inc();
                    tracing::info!(hint = %hint.kind, "security policy reloaded from pub/sub hint");
                }
                tracing::warn!("config store pub/sub stream ended, resubscribing");
            }
            Err(e) => {
                let err = GatewayError::ConfigStoreTransient(e.to_string());
                metrics
                    .config_store_reload_total
                    .get_or_create(&ResultLabel { result: "error" })
                    .inc();
                tracing::warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "config store subscribe failed, retrying");
            }
        }

        let jitter_frac: f64 = rand::rng().random_range(0.0..0.25);
        tokio::time::sleep(backoff.mul_f64(1.0 + jitter_frac)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
