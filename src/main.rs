use relay_gateway::config::Settings;
use relay_gateway::gateway::Gateway;
use relay_gateway::server::{ListenerManager, admin_app};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level)),
        )
        .init();

    let admin_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let (gateway, archive_writer) = Gateway::from_settings(settings).await?;

    let listeners = ListenerManager::new(gateway.clone());
    listeners.reconcile().await;
    let watcher = listeners.watch();

    let admin = tokio::net::TcpListener::bind(&admin_addr).await?;
    tracing::info!("Management API running on http://{}", admin_addr);
    axum::serve(admin, admin_app(gateway.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    watcher.abort();
    listeners.shutdown().await;

    // 释放所有发送端后写入任务才会结束
    drop(listeners);
    drop(gateway);
    if let Some(writer) = archive_writer {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer).await;
    }
    Ok(())
}
