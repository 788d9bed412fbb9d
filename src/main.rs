// ABOUTME: Main entry point for the Matrix-Telegram bridge
// ABOUTME: Initializes logging, config, store, Matrix connector, and the portal registry

use anyhow::{Context, Result};
use std::sync::Arc;
use telebridge::config::Config;
use telebridge::dispatch::Dispatcher;
use telebridge::intent::PlainFormatter;
use telebridge::matrix::MatrixConnector;
use telebridge::portal::{PortalDeps, PortalRegistry};
use telebridge::puppet::PuppetRegistry;
use telebridge::store::BridgeStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Print panic details before the process dies; the hook fires even when
    // the panic happens off the main task
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n============================================================");
        eprintln!(" telebridge panicked");
        eprintln!("============================================================\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Default to info; the sdk's HTTP and sync internals flood
                // that level on every homeserver round trip
                "info,telebridge=debug,matrix_sdk::http_client=warn,matrix_sdk::event_cache=warn"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Matrix-Telegram bridge");

    // Load configuration
    dotenvy::dotenv().ok();
    let config_path =
        std::env::var("TELEBRIDGE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Arc::new(Config::load(&config_path)?);

    tracing::info!(
        homeserver = %config.homeserver.address,
        domain = %config.homeserver.domain,
        bot_user_id = %config.homeserver.bot_user_id,
        database = %config.database.path,
        "Configuration loaded"
    );

    // Open the bridge database
    let store = BridgeStore::new(&config.database.path)?;
    tracing::info!(path = %config.database.path, "Bridge store initialized");

    // Matrix connector: the bot intent plus lazily created ghost intents
    let access_token = config
        .homeserver
        .access_token
        .as_deref()
        .context("homeserver.access_token (or TELEBRIDGE_ACCESS_TOKEN) is required")?;
    let intents = Arc::new(MatrixConnector::new(
        &config.homeserver.address,
        &config.homeserver.domain,
        &config.homeserver.bot_user_id,
        access_token,
    ));

    let puppets = Arc::new(PuppetRegistry::new(store.clone()));
    let deps = Arc::new(PortalDeps {
        store,
        config: Arc::clone(&config),
        intents,
        formatter: Arc::new(PlainFormatter),
        puppets,
    });
    let registry = Arc::new(PortalRegistry::new(Arc::clone(&deps)));
    let _dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));

    tracing::info!("Portal registry ready; waiting for transport sessions");

    // The Telegram session layer and homeserver sync feed the dispatcher from
    // their own tasks. Without them attached the process just holds the
    // registry open until interrupted.
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    Ok(())
}
