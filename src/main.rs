//! krakentrail - headless ATR trailing-stop daemon for Kraken spot.
//!
//! Two long-lived tasks: the trading loop (one sampling session per
//! interval across all configured pairs) and the Telegram control plane.
//! Ctrl+C finishes the in-flight pair, persists state, then stops the
//! control plane.
//!
//! # Usage
//! ```sh
//! MODE=multipliers PAIRS=XBTEUR cargo run
//! ```

use anyhow::Result;
use krakentrail::application::control::{Notifier, PauseFlag};
use krakentrail::application::engine::TrailingEngine;
use krakentrail::application::session::SessionLoop;
use krakentrail::config::Config;
use krakentrail::infrastructure::kraken::KrakenClient;
use krakentrail::infrastructure::state::FileStateStore;
use krakentrail::interfaces::telegram::ControlPlane;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("krakentrail {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: mode={}, pairs={:?}, interval={}s",
        config.mode, config.pairs, config.sleeping_interval
    );

    let exchange = Arc::new(KrakenClient::new(
        config.kraken_api_key.clone(),
        config.kraken_api_secret.clone(),
        config.atr_data_days,
    ));

    // Pair aliases come from the exchange listing; a configured pair the
    // exchange does not know is a startup failure.
    let pairs = exchange.resolve_pairs(&config.pairs).await?;

    let store = Arc::new(FileStateStore::new(&config.state_dir)?);

    let pause = PauseFlag::new();
    let (notifier, notifications) = Notifier::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_plane = ControlPlane::new(
        &config.telegram_token,
        config.allowed_user_id,
        config.poll_interval_sec,
        exchange.clone(),
        store.clone(),
        pause.clone(),
        pairs.clone(),
        config.mode,
    );
    control_plane
        .announce("🤖 krakentrail started and running. Use /help to see available commands.")
        .await;
    let (control_handle, control_shutdown) = control_plane.start(notifications);

    let engine = TrailingEngine::new(
        config.mode,
        config.pair_params.clone(),
        config.min_allocation.clone(),
        notifier.clone(),
    );
    let session = SessionLoop::new(
        exchange.clone(),
        store.clone(),
        engine,
        pairs,
        Duration::from_secs(config.sleeping_interval),
        pause.clone(),
        shutdown_rx,
    );
    let trading = tokio::spawn(session.run());

    info!("Daemon running. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Finishing the in-flight pair...");

    let _ = shutdown_tx.send(true);
    let _ = trading.await;

    notifier.notify("🛑 krakentrail stopped by operator.");
    if let Ok(stopped) = control_shutdown.shutdown() {
        let _ = tokio::time::timeout(Duration::from_secs(5), stopped).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), control_handle).await;

    info!("Shutdown complete.");
    Ok(())
}
