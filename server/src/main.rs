use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server::chain::http::HttpChainClient;
use server::config::Settings;
use server::db::{create_pool, run_migrations};
use server::services::provisioner::{EscrowProvisioner, ProvisionerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load environment variables
    dotenvy::dotenv().ok();

    // 2. Initialize structured logging (tracing)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,diesel=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Escrow Marketplace Server");

    // 3. Settings and database connection pool
    let settings = Arc::new(Settings::from_env().context("Failed to load settings")?);
    let pool =
        create_pool(&settings.database_url).context("Failed to create database connection pool")?;

    {
        let mut conn = pool.get().context("Failed to get DB connection")?;
        run_migrations(&mut conn).context("Failed to run migrations")?;
    }
    info!("Database connection pool created, migrations applied");

    // 4. Chain RPC client
    let chain = Arc::new(
        HttpChainClient::new(
            settings.chain_endpoints.clone(),
            settings.chain_api_key.clone(),
            settings.rpc_timeout_secs,
        )
        .context("Failed to build chain client")?,
    );

    // 5. Background escrow provisioner
    let provisioner_config = ProvisionerConfig {
        poll_interval_secs: env::var("PROVISIONER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(ProvisionerConfig::default().poll_interval_secs),
        ..ProvisionerConfig::default()
    };
    let provisioner = Arc::new(EscrowProvisioner::new(
        pool.clone(),
        chain.clone(),
        settings.clone(),
        provisioner_config,
    ));
    let provisioner_task = tokio::spawn(provisioner.run());

    info!("Escrow provisioner running; press Ctrl-C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        result = provisioner_task => {
            result.context("Provisioner task terminated")?;
        }
    }

    Ok(())
}
