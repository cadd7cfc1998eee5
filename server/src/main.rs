use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

// Use jemalloc on Linux for reduced fragmentation and better throughput
// on long-running server processes.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use chatwire_server::config::ServerConfig;
use chatwire_server::relay::AppState;
use chatwire_server::routing;
use chatwire_server::store::UserStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chatwire_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting Chatwire signaling server");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let store = UserStore::connect(&config.database_url).await?;
    info!("User store initialized");

    let state = std::sync::Arc::new(AppState::new(config.clone(), store));

    // Optional ring-timeout sweep. Off by default: the protocol itself
    // never times a ringing call out (clients own the ringing UI timeout).
    if let Some(ring_secs) = config.call_ring_timeout_seconds {
        let sweep_state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let expired = sweep_state
                    .calls
                    .expire_stale_requests(Duration::from_secs(ring_secs));
                if expired > 0 {
                    info!("ring timeout: expired {} pending call(s)", expired);
                }
            }
        });
        info!("Ring timeout enabled ({}s)", ring_secs);
    }

    let app = routing::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Graceful shutdown signal (cross-platform)
    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("Server stopped cleanly");
    Ok(())
}
