use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{session_store::SessionStore, storage::StorageError},
    state::{ConnectionHealth, SharedContext},
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Connect to the session store and keep the context's store slot and
/// connection health in line with its reachability.
pub async fn run<F, Fut>(context: SharedContext, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn SessionStore>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(store) => {
                context.install_store(store.clone()).await;
                info!("session store connected; leaving degraded mode");
                delay = INITIAL_DELAY;

                loop {
                    match store.health_check().await {
                        Ok(()) => {
                            if context.health() != ConnectionHealth::Connected {
                                info!("session store healthy again");
                                context.update_health(ConnectionHealth::Connected);
                            }
                            sleep(HEALTH_POLL_INTERVAL).await;
                        }
                        Err(err) => {
                            warn!(error = %err, "session store health check failed");
                            let mut attempt = 0;
                            let mut reconnect_delay = INITIAL_DELAY;
                            let mut reconnected = false;

                            while attempt < MAX_RECONNECT_ATTEMPTS {
                                context.update_health(ConnectionHealth::Reconnecting {
                                    attempt: attempt + 1,
                                });
                                match store.try_reconnect().await {
                                    Ok(()) => {
                                        info!(
                                            "session store reconnection succeeded after health check failure"
                                        );
                                        reconnected = true;
                                        break;
                                    }
                                    Err(reconnect_err) => {
                                        warn!(attempt, error = %reconnect_err, "session store reconnect attempt failed");
                                        attempt += 1;
                                        sleep(reconnect_delay).await;
                                        reconnect_delay = (reconnect_delay * 2).min(MAX_DELAY);
                                    }
                                }
                            }

                            if reconnected {
                                context.update_health(ConnectionHealth::Connected);
                                sleep(HEALTH_POLL_INTERVAL).await;
                                continue;
                            } else {
                                warn!(
                                    "exhausted session store reconnect attempts; entering degraded mode"
                                );
                                context.clear_store().await;
                                break;
                            }
                        }
                    }
                }

                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => {
                warn!(error = %err, "session store connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig, dao::session_store::memory::MemorySessionStore, state::SyncContext,
    };

    #[tokio::test]
    async fn installs_store_once_connected() {
        let context = SyncContext::new(AppConfig::default());
        assert!(context.is_degraded().await);

        let store = MemorySessionStore::new();
        let supervisor = tokio::spawn(run(context.clone(), move || {
            let store = store.clone();
            async move { Ok(Arc::new(store) as Arc<dyn SessionStore>) }
        }));

        let mut health = context.health_watcher();
        tokio::time::timeout(
            Duration::from_secs(1),
            health.wait_for(|h| *h == ConnectionHealth::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!context.is_degraded().await);

        supervisor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_store_is_cleared_after_retries() {
        let context = SyncContext::new(AppConfig::default());
        let store = MemorySessionStore::new();
        let probe = store.clone();
        let supervisor = tokio::spawn(run(context.clone(), move || {
            let store = store.clone();
            async move { Ok(Arc::new(store) as Arc<dyn SessionStore>) }
        }));

        let mut health = context.health_watcher();
        health
            .wait_for(|h| *h == ConnectionHealth::Connected)
            .await
            .unwrap();

        probe.set_online(false);
        health
            .wait_for(|h| matches!(h, ConnectionHealth::Reconnecting { .. }))
            .await
            .unwrap();
        health
            .wait_for(|h| *h == ConnectionHealth::Disconnected)
            .await
            .unwrap();
        assert!(context.is_degraded().await);

        supervisor.abort();
    }
}
