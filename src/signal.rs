//! SIGINT/SIGTERM handling. A second Ctrl+C while already shutting down exits immediately.

use tokio::sync::oneshot;

pub struct Shutdown {
    rx: oneshot::Receiver<()>,
}

pub struct ShutdownTrigger {
    tx: oneshot::Sender<()>,
}

impl ShutdownTrigger {
    pub fn shutdown_now(self) {
        let _ = self.tx.send(());
    }
}

pub fn shutdown_handle() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = oneshot::channel();
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    /// Waits for SIGTERM, SIGINT, or an explicit trigger, whichever comes first.
    /// A second SIGINT received after the first exits the process immediately.
    pub async fn wait(self) {
        imp::wait(self.rx).await
    }
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{signal, SignalKind};

    pub async fn wait(explicit: tokio::sync::oneshot::Receiver<()>) {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, starting drain");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, starting drain");
                tokio::spawn(async move {
                    sigint.recv().await;
                    tracing::warn!("received second SIGINT, exiting immediately");
                    std::process::exit(130);
                });
            }
            _ = explicit => {
                tracing::info!("shutdown triggered explicitly");
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub async fn wait(explicit: tokio::sync::oneshot::Receiver<()>) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, starting drain");
            }
            _ = explicit => {
                tracing::info!("shutdown triggered explicitly");
            }
        }
    }
}
