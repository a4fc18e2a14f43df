//! Keep-alive sidecar for catalog sessions.
//!
//! Long plane transfers can outlast the catalog's idle timeout, so every open
//! session gets a background task that pings it at a fixed interval. The task
//! belongs to the scope that opened the session: [`ScopedSession::close`]
//! stops the sidecar before logging out, and dropping a [`KeepAlive`] aborts
//! the task, so a sidecar never outlives its session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::catalog::{Catalog, CatalogSession, Credentials};
use crate::error::CatalogError;

/// Handle to a running keep-alive task.
#[derive(Debug)]
pub struct KeepAlive {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    pings: Arc<AtomicU64>,
}

impl KeepAlive {
    /// Start pinging `session` every `interval`. The first ping is sent one
    /// full interval after the call.
    pub fn spawn(session: Arc<dyn CatalogSession>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let pings = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&pings);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match session.keep_alive().await {
                            Ok(()) => {
                                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                                debug!(pings = n, "Catalog session kept alive");
                            }
                            Err(e) => warn!(error = %e, "Keep-alive ping failed"),
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            pings,
        }
    }

    /// Successful pings so far.
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the task and wait for it to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "Keep-alive task panicked");
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// A catalog session paired with its keep-alive sidecar.
pub struct ScopedSession {
    session: Arc<dyn CatalogSession>,
    keepalive: KeepAlive,
}

impl ScopedSession {
    /// Connect and start the sidecar.
    pub async fn open(
        catalog: &dyn Catalog,
        credentials: &Credentials,
        interval: Duration,
    ) -> Result<Self, CatalogError> {
        let session = catalog.connect(credentials).await?;
        let keepalive = KeepAlive::spawn(Arc::clone(&session), interval);
        Ok(Self { session, keepalive })
    }

    pub fn session(&self) -> &Arc<dyn CatalogSession> {
        &self.session
    }

    pub fn keepalive(&self) -> &KeepAlive {
        &self.keepalive
    }

    /// Stop the sidecar, then log out.
    pub async fn close(self) -> Result<(), CatalogError> {
        self.keepalive.stop().await;
        self.session.close().await
    }
}
