//! Background maintenance driver.
//!
//! Three independent loops: key synchronization to trusted companion
//! devices, a heartbeat for the current device, and cleanup of expired
//! challenges and sessions. Each loop is idempotent and tolerates the
//! others failing; all share one shutdown signal.
//!
//! The sweeps themselves are plain methods on
//! [`MessagingContext`](crate::context::MessagingContext), so tests tick
//! them deterministically without spawning anything. The scheduler only
//! adds timers.

use std::{sync::Arc, time::Duration};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::{context::MessagingContext, env::Environment, transport::Transport};

/// Sweep cadences.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    /// Key synchronization cadence
    pub key_sync_interval: Duration,
    /// Current-device heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Challenge and session cleanup cadence
    pub cleanup_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            key_sync_interval: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Handle to the spawned maintenance loops.
pub struct MaintenanceScheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceScheduler {
    /// Spawn the three maintenance loops.
    ///
    /// The context lock is held only for the duration of each sweep;
    /// request-path callers contend on nothing else.
    pub fn spawn<E, T>(
        env: E,
        ctx: Arc<Mutex<MessagingContext<E>>>,
        transport: Arc<T>,
        config: MaintenanceConfig,
    ) -> Self
    where
        E: Environment,
        T: Transport + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        {
            let env = env.clone();
            let ctx = Arc::clone(&ctx);
            let transport = Arc::clone(&transport);
            let mut rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = env.sleep(config.key_sync_interval) => {
                            let delivered =
                                ctx.lock().await.key_sync_sweep(transport.as_ref()).await;
                            tracing::debug!(delivered, "key sync loop ticked");
                        }
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        {
            let env = env.clone();
            let ctx = Arc::clone(&ctx);
            let mut rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = env.sleep(config.heartbeat_interval) => {
                            if let Err(e) = ctx.lock().await.heartbeat_tick() {
                                tracing::warn!(error = %e, "heartbeat failed");
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        {
            let mut rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = env.sleep(config.cleanup_interval) => {
                            let (challenges, sessions) = ctx.lock().await.cleanup_tick();
                            tracing::debug!(challenges, sessions, "cleanup loop ticked");
                        }
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        Self { shutdown, handles }
    }

    /// Stop every loop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
