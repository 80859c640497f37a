//! Runtime - Ctrl+C / SIGTERM handling for long-running CLI commands

use tokio::sync::watch;

/// Shutdown flag shared by the tasks of one command
#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Trigger shutdown. Later calls have no effect.
    pub fn trigger(&self) {
        self.sender.send_if_modified(|triggered| !std::mem::replace(triggered, true));
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once shutdown was triggered
    pub async fn wait(&self) {
        let mut rx = self.sender.subscribe();
        // Err only if the sender is gone, which `self` rules out
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// Install signal handlers and return the shutdown handle
pub fn install_signal_handlers() -> Shutdown {
    let shutdown = Shutdown::new();
    let handle = shutdown.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                        _ = sigint.recv() => tracing::info!("Received SIGINT"),
                    }
                }
                _ => {
                    tracing::warn!("Signal handlers unavailable, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Ctrl+C handler failed: {}", e);
                return;
            }
            tracing::info!("Received Ctrl+C");
        }

        handle.trigger();
    });

    shutdown
}
