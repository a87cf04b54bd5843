use std::sync::Arc;

use tokio::sync::watch;

use vbank_bridge::api;
use vbank_bridge::config::Config;
use vbank_bridge::db::{self, memory::MemoryStore, BridgeStore, PgStore};
use vbank_bridge::runtime::BridgeRuntime;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    init_logging(config.log_json);

    tracing::info!("Starting VBank bridge node");
    tracing::info!(
        home_rpc = %config.home.rpc_url,
        home_chain_id = config.home.chain_id,
        chains = config.chains.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn BridgeStore> = match &config.database {
        Some(database) => {
            let pool = db::create_pool(&database.url).await?;
            tracing::info!("Database connected");
            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, bridge state is kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let runtime = Arc::new(BridgeRuntime::from_config(&config, store)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let api_runtime = runtime.clone();
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_port, api_runtime).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    if let Err(e) = runtime.run(shutdown_rx).await {
        tracing::error!(error = %e, "Bridge runtime error");
        return Err(e);
    }

    tracing::info!("VBank bridge node stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vbank_bridge=debug"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
