//! Periodic session keep-alive
//!
//! The ping loop never restarts itself. When a ping fails the loop reports
//! [`KeepAliveStatus::Failed`] and exits; whoever owns the session decides
//! whether to authenticate again.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use super::session::SessionManager;

/// Default ping interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Observable state of the keep-alive loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveStatus {
    /// Waiting for the first ping
    Starting,
    /// Last ping reached the controller
    Alive {
        pings: u64,
        last_status: u16,
        last_ping: SystemTime,
    },
    /// The loop has exited; the session must be treated as lost
    Failed { reason: String },
    /// Stopped by its owner
    Stopped,
}

impl KeepAliveStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, KeepAliveStatus::Failed { .. })
    }
}

/// Handle to a running keep-alive loop; stops the loop when dropped
pub struct KeepAliveHandle {
    status_tx: Arc<watch::Sender<KeepAliveStatus>>,
    status_rx: watch::Receiver<KeepAliveStatus>,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveHandle {
    /// Latest status
    pub fn status(&self) -> KeepAliveStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<KeepAliveStatus> {
        self.status_rx.clone()
    }

    /// Wait until the loop reports a failure, returning the reason
    pub async fn failed(&self) -> String {
        let mut rx = self.status_rx.clone();
        loop {
            if let KeepAliveStatus::Failed { reason } = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                return "keep-alive status channel closed".to_string();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            if !self.status_tx.borrow().is_failed() {
                self.status_tx.send_replace(KeepAliveStatus::Stopped);
            }
            info!("Keep-alive stopped");
        }
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keep-alive loop spawner
pub struct KeepAlive;

impl KeepAlive {
    /// Spawn the ping loop; the first ping runs one `interval` from now
    pub fn spawn(session: Arc<SessionManager>, interval: Duration) -> KeepAliveHandle {
        let (tx, rx) = watch::channel(KeepAliveStatus::Starting);
        let status_tx = Arc::new(tx);
        let task_tx = status_tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pings: u64 = 0;

            loop {
                ticker.tick().await;

                match session.ping().await {
                    Ok(401) => {
                        error!("Controller rejected the session during keep-alive");
                        task_tx.send_replace(KeepAliveStatus::Failed {
                            reason: "session rejected by controller (401)".to_string(),
                        });
                        return;
                    }
                    Ok(status) => {
                        pings += 1;
                        if (200..300).contains(&status) {
                            info!("Performed keep-alive for controller session ({})", status);
                        } else {
                            warn!("Keep-alive ping returned status {}", status);
                        }
                        task_tx.send_replace(KeepAliveStatus::Alive {
                            pings,
                            last_status: status,
                            last_ping: SystemTime::now(),
                        });
                    }
                    Err(e) => {
                        error!("Keep-alive failed, session is now stale: {}", e);
                        task_tx.send_replace(KeepAliveStatus::Failed {
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
        });

        KeepAliveHandle {
            status_tx,
            status_rx: rx,
            task: Some(task),
        }
    }
}
