use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;

use super::dialect_app;
use crate::config::ApiType;
use crate::events::GatewayEvent;
use crate::gateway::Gateway;

const DRAIN_GRACE: Duration = Duration::from_secs(2);

struct RunningListener {
    port: u16,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Keeps one axum server per enabled dialect, bound to the configured port.
/// `reconcile` brings the running set in line with the current config.
pub struct ListenerManager {
    gateway: Arc<Gateway>,
    running: Mutex<BTreeMap<ApiType, RunningListener>>,
}

impl ListenerManager {
    pub fn new(gateway: Arc<Gateway>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            running: Mutex::new(BTreeMap::new()),
        })
    }

    /// Dialects currently served, with their ports.
    pub async fn active(&self) -> Vec<(ApiType, u16)> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(api_type, l)| (*api_type, l.port))
            .collect()
    }

    pub async fn reconcile(&self) {
        let protocols = self.gateway.config().protocols;
        let host = self.gateway.settings().gateway.listen_host.clone();
        let mut running = self.running.lock().await;

        // 先停掉需要变更的监听器，端口互换时才能重新绑定
        let mut stopping = Vec::new();
        for api_type in ApiType::ALL {
            let wanted = protocols.get(api_type);
            let keep = running
                .get(&api_type)
                .is_some_and(|l| wanted.enabled && l.port == wanted.port);
            if !keep && let Some(listener) = running.remove(&api_type) {
                tracing::info!(%api_type, port = listener.port, "stopping listener");
                let _ = listener.shutdown.send(());
                stopping.push(listener.handle);
            }
        }
        for handle in stopping {
            if tokio::time::timeout(DRAIN_GRACE, handle).await.is_err() {
                tracing::debug!("listener still draining connections");
            }
        }

        for api_type in ApiType::ALL {
            let wanted = protocols.get(api_type);
            if !wanted.enabled || running.contains_key(&api_type) {
                continue;
            }
            match self.start(api_type, &host, wanted.port).await {
                Ok(listener) => {
                    running.insert(api_type, listener);
                }
                Err(e) => {
                    tracing::error!(%api_type, port = wanted.port, "failed to bind listener: {}", e);
                }
            }
        }
    }

    async fn start(&self, api_type: ApiType, host: &str, port: u16) -> std::io::Result<RunningListener> {
        let listener = TcpListener::bind((host, port)).await?;
        let port = listener.local_addr()?.port();
        let app = dialect_app(self.gateway.clone(), api_type);
        let (shutdown, rx) = oneshot::channel::<()>();
        tracing::info!(%api_type, "listening on http://{}:{}", host, port);

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(%api_type, "listener exited: {}", e);
            }
        });
        Ok(RunningListener {
            port,
            shutdown,
            handle,
        })
    }

    /// Re-reconcile whenever the gateway config changes.
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let mut events = self.gateway.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(GatewayEvent::ConfigChanged { revision }) => {
                        tracing::debug!(revision, "reconciling listeners");
                        manager.reconcile().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => manager.reconcile().await,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (api_type, listener) in std::mem::take(&mut *running) {
            tracing::info!(%api_type, port = listener.port, "stopping listener");
            let _ = listener.shutdown.send(());
            let _ = tokio::time::timeout(DRAIN_GRACE, listener.handle).await;
        }
    }
}
