use apphost::config::Config;
use apphost::orchestrator::Orchestrator;
use apphost::pool::{BackendPool, PoolConfig};
use apphost::ports::PortAllocator;
use apphost::proxy::{ProxyServer, ProxyState};
use apphost::registry::AppRegistry;
use apphost::supervisor::ProcessSupervisor;
use apphost::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("apphost=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Build the lifecycle stack
    let registry = Arc::new(AppRegistry::load(&config.server.data_dir)?);
    let allocator = PortAllocator::new(config.server.port_min, config.server.port_max)?;
    let (supervisor, exit_rx) = ProcessSupervisor::new(config.runtime.clone());
    let orchestrator = Orchestrator::new(Arc::clone(&registry), allocator, supervisor);
    orchestrator.spawn_exit_loop(exit_rx);

    // Reconcile persisted state with what actually survived
    orchestrator.recover().await?;
    info!(apps = registry.len(), "Recovery complete");

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Backend pool configured"
    );

    let state = Arc::new(ProxyState {
        orchestrator: Arc::clone(&orchestrator),
        pool: BackendPool::new(pool_config),
        console_port: config.server.console_port,
        request_timeout: config.server.request_timeout(),
        public_base: config.server.public_base(),
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(bind_addr, state, shutdown_rx);
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown. Hosted app processes are left running on purpose;
    // recovery re-adopts them on the next start.
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting app host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        console_port = config.server.console_port,
        data_dir = %config.server.data_dir.display(),
        "Server configuration"
    );
    info!(
        port_min = config.server.port_min,
        port_max = config.server.port_max,
        request_timeout_secs = config.server.request_timeout_secs,
        "Routing settings"
    );
    info!(
        setup = %config.runtime.setup,
        install = %config.runtime.install,
        run = %config.runtime.run,
        install_timeout_secs = config.runtime.install_timeout_secs,
        liveness_window_ms = config.runtime.liveness_window_ms,
        grace_period_secs = config.runtime.grace_period_secs,
        "Runtime commands"
    );
}
