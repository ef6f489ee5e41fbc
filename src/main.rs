use anyhow::{Context, Result};
use relay_core::config::{load_config, RelayConfig};
use relay_core::credentials::{Platform, RecordKind};
use relay_core::session::run_session_sweep;
use relay_core::Relay;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_core=info".into()),
        )
        .init();

    info!("Relay core starting...");

    let config = match std::env::var("RELAY_CONFIG") {
        Ok(path) => load_config(&path)
            .with_context(|| format!("Failed to load config from {}", path))?
            .with_env(),
        Err(_) => RelayConfig::from_env(),
    };

    let relay = Relay::open(&config).context("Failed to initialize relay core")?;

    let tenants = relay.vault.all_of_type(RecordKind::Uuid)?.len();
    let pages = relay.vault.linked_accounts(Platform::Facebook)?.len();
    let shops = relay.vault.linked_accounts(Platform::Shopify)?.len();
    info!(tenants, pages, shops, "Credential vault loaded");

    let removed = relay.sessions.sweep_stale()?;
    info!(removed, "Initial session sweep complete");

    let sweep = tokio::spawn(run_session_sweep(
        relay.sessions.clone(),
        config.session.sweep_interval_seconds,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    warn!("Shutdown signal received");
    sweep.abort();

    Ok(())
}
