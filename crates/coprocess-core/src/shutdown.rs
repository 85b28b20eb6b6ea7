use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What happens to in-flight calls once shutdown begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Drop in-flight calls immediately.
    Cancel,
    /// Stop accepting connections and let in-flight calls finish.
    #[default]
    Drain,
}

#[derive(Debug, Clone)]
pub struct ShutdownPolicy {
    pub mode: ShutdownMode,
    pub drain_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::Drain,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownState {
    is_shutting_down: AtomicBool,
    notify: Notify,
}

impl ShutdownState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns `true` for the call that started shutdown.
    pub fn begin(&self) -> bool {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }
}

/// Begins shutdown on the first Ctrl-C.
pub fn listen_for_ctrl_c(state: Arc<ShutdownState>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!(target: "coprocess", "received Ctrl-C, shutting down");
                state.begin();
            }
            Err(err) => {
                tracing::error!(target: "coprocess", error = %err, "failed to listen for Ctrl-C");
            }
        }
    });
}
