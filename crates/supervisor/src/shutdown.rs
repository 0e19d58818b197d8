//! Cooperative shutdown
//!
//! A trigger flips a shared flag once; every clone of the signal observes
//! it. Long waits (backoff, watchdog interval) race against the signal, while
//! work that must not be torn down halfway (a running reset) simply does not
//! listen to it.

use std::future;
use std::io;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Create a connected trigger/signal pair
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx: Some(rx) })
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once shutdown has been requested.
    ///
    /// Pends forever for [`ShutdownSignal::never`] or when the trigger was
    /// dropped without firing.
    pub async fn cancelled(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|triggered| *triggered).await.is_ok() {
                return;
            }
        }
        future::pending::<()>().await
    }
}

/// Fire `trigger` on SIGINT or SIGTERM
pub fn listen_for_termination(trigger: ShutdownTrigger) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
        trigger.trigger();
    }))
}
