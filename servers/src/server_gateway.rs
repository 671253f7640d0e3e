use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

mod gateway_logic;
use gateway_logic::{config, downstream, engine, logger, monitor, state, store, upstream};

/// How long components get to drain after the shutdown signal.
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(&config)?;
    log::info!(
        "Starting session gateway on port {} (imaging host {}:{})",
        config.port,
        config.nina_host,
        config.nina_api_port
    );

    // An unwritable database is the one fatal boot condition.
    let session_store = store::SessionStore::open(&config.db_path)
        .with_context(|| format!("cannot open database at {}", config.db_path.display()))?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let (engine_tx, engine_rx) = mpsc::unbounded_channel();
    let app_state = state::AppState::new(&config, engine_tx, shutdown_tx.clone());

    let engine_handle = tokio::spawn(engine::run(
        config.clone(),
        app_state.clone(),
        session_store,
        engine_rx,
        shutdown_tx.subscribe(),
    ));

    let upstream_handle = tokio::spawn(upstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down, bounded so the process always exits.
    let drained = tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), async {
        let _ = tokio::try_join!(
            engine_handle,
            upstream_handle,
            downstream_handle,
            monitor_handle
        );
    })
    .await;
    if drained.is_err() {
        log::warn!("Components did not drain within {}s; exiting anyway.", SHUTDOWN_GRACE_SECS);
    }

    log::info!("Shutdown complete.");
    Ok(())
}
