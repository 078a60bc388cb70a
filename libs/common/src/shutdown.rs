//! Graceful shutdown
//!
//! Signal handling plus a `watch`-based trigger that long-running loops
//! (scanner, dispatch worker, gateway) can subscribe to. SIGHUP is exposed
//! separately as a reload request.

use tokio::sync::watch;
use tracing::{info, warn};

/// Wait for Ctrl+C, or SIGTERM on Unix
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("SIGTERM handler: {}; Ctrl+C only", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal {
                    Some(mut sig) => { sig.recv().await; },
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// SIGHUP listener used to re-read settings without a restart.
///
/// Never fires on platforms without SIGHUP or when the handler can't be
/// installed.
#[derive(Debug)]
pub struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let hangup = match signal(SignalKind::hangup()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    warn!("SIGHUP handler: {}; reload disabled", e);
                    None
                },
            };
            Self { hangup }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Wait for the next reload request
    pub async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if let Some(sig) = self.hangup.as_mut() {
                if sig.recv().await.is_some() {
                    return;
                }
                self.hangup = None;
            }
        }
        std::future::pending::<()>().await
    }
}

impl Default for ReloadSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcasts a single shutdown request to any number of tasks
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        info!("Shutdown requested");
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once `rx` observes shutdown or its sender is gone
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let trigger = ShutdownTrigger::new();
        let mut a = trigger.subscribe();
        let mut b = trigger.subscribe();

        let waiter = tokio::spawn(async move { shutdown_requested(&mut a).await });
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        shutdown_requested(&mut b).await;
        assert!(trigger.is_triggered());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_signal_fires_on_sighup() {
        let mut reload = ReloadSignal::new();
        std::process::Command::new("kill")
            .args(["-HUP", &std::process::id().to_string()])
            .status()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), reload.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_waiters() {
        let trigger = ShutdownTrigger::new();
        let mut rx = trigger.subscribe();
        drop(trigger);
        shutdown_requested(&mut rx).await;
    }
}
