//! Lifecycle Controller (C6): owns the listener, the accept loop, the draining flag,
//! and the ordered shutdown sequence (§4.6).

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::drain::DrainState;
use crate::proxy::{self, Dispatcher};
use crate::signal::Shutdown;
use crate::store::ConfigStore;

enum AcceptErrorClass {
    Closed,
    Transient,
    Fatal,
}

fn classify_accept_error(e: &std::io::Error) -> AcceptErrorClass {
    match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock => AcceptErrorClass::Transient,
        ErrorKind::Other | ErrorKind::ConnectionAborted => AcceptErrorClass::Transient,
        _ => AcceptErrorClass::Fatal,
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, drain: DrainState) {
    loop {
        tokio::select! {
            biased;
            _ = drain.wait_for_close() => {
                tracing::info!("listener closing for drain");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            proxy::dispatch(dispatcher, stream, remote_addr).await;
                        });
                    }
                    Err(e) => match classify_accept_error(&e) {
                        AcceptErrorClass::Closed => {
                            tracing::info!("listener closed, exiting accept loop");
                            return;
                        }
                        AcceptErrorClass::Transient => {
                            tracing::warn!(error = %e, "transient accept error, continuing");
                        }
                        AcceptErrorClass::Fatal => {
                            tracing::error!(error = %e, "fatal accept error, exiting accept loop");
                            return;
                        }
                    },
                }
            }
        }
    }
}

pub struct ShutdownPlan {
    pub shutdown_timeout: Duration,
}

impl ShutdownPlan {
    /// `k8s_wait`: default 5s, 2s if the total shutdown timeout is under 10s.
    fn k8s_wait(&self) -> Duration {
        if self.shutdown_timeout < Duration::from_secs(10) {
            Duration::from_secs(2)
        } else {
            Duration::from_secs(5)
        }
    }

    fn remaining_after_k8s_wait(&self) -> Duration {
        self.shutdown_timeout.saturating_sub(self.k8s_wait())
    }
}

/// Binds the listener, runs the accept loop until a shutdown signal arrives, then
/// executes the ordered shutdown sequence from §4.6.
pub async fn run(
    listen_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    drain: DrainState,
    shutdown: Shutdown,
    plan: ShutdownPlan,
    mgmt_shutdown_tx: watch::Sender<bool>,
    store: Arc<dyn ConfigStore>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "listener bound, accepting connections");

    let accept_handle = tokio::spawn(accept_loop(listener, dispatcher, drain.clone()));

    shutdown.wait().await;

    // Step 1: set the draining flag. Readiness observes it immediately.
    drain.begin_draining();

    // Step 2: let the orchestrator propagate endpoint removal. The management server
    // keeps serving through this window.
    let k8s_wait = plan.k8s_wait();
    tracing::info!(?k8s_wait, "draining: waiting for endpoint propagation");
    tokio::time::sleep(k8s_wait).await;

    // Step 3: close the listener; the accept loop exits cleanly.
    drain.close_listener();
    let _ = accept_handle.await;

    // Step 4: allow in-flight sessions to drain. The default policy is not to cancel
    // them; the orchestrator's termination-grace-period boundary is the backstop.
    let remaining = plan.remaining_after_k8s_wait();
    tracing::info!(?remaining, "draining: waiting for in-flight sessions");
    tokio::time::sleep(remaining).await;

    // Step 5: shut down the metrics endpoint with a short graceful timeout.
    let _ = mgmt_shutdown_tx.send(true);

    // Step 6: background tasks (the management server, the config-store subscription
    // loop) are joined by the caller, which owns their handles.

    // Step 7: close the config store client last.
    drop(store);

    tracing::info!("shutdown sequence complete");
    Ok(())
}
