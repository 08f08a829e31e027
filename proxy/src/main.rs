// Ergo mining proxy
//
// Work cache, upstream failover and share pipeline behind an HTTP mining API.

use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ergo_proxy::api::{self, ApiState};
use ergo_proxy::config::Config;
use ergo_proxy::policy::PolicyServer;
use ergo_proxy::shares::RedisStorage;
use ergo_proxy::Orchestrator;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = ctrl_c => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                tracing::info!("SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let path = Config::resolve_path();
    let cfg = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!("🚀 Ergo proxy '{}' starting ({})", cfg.name, path.display());

    let storage = Arc::new(RedisStorage::new(&cfg.redis.url, &cfg.redis.prefix, cfg.redis.timeout())?);
    let policy = Arc::new(PolicyServer::new(cfg.proxy.policy.clone()));

    let listen = cfg.proxy.listen.clone();
    let limit_body_size = cfg.proxy.limit_body_size;
    let behind_reverse_proxy = cfg.proxy.behind_reverse_proxy;

    let orchestrator = Arc::new(Orchestrator::new(cfg, storage, policy)?);
    let tasks = orchestrator.start().await;

    let state = ApiState {
        gateway: orchestrator.gateway(),
        limit_body_size,
        behind_reverse_proxy,
    };
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;

    tracing::info!("📡 Starting proxy on {}", listen);
    api::serve(listener, state, shutdown_signal()).await?;

    tasks.shutdown();
    tracing::info!("🏁 Ergo proxy shut down cleanly");
    Ok(())
}
