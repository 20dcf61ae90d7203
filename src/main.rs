use paddock::api::{ApiServer, AppState};
use paddock::billing::{Billing, PaymentClient};
use paddock::config::Config;
use paddock::credentials::TokenSigner;
use paddock::db::{self, Db};
use paddock::engine::{Engine, EngineSettings};
use paddock::proxy::ProxyGateway;
use paddock::ratelimit::RateLimiter;
use paddock::workspace::WorkspaceManager;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("paddock=info".parse().expect("valid log directive")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    db::set_slow_query_threshold(config.slow_query_threshold);
    let db = Db::connect(&config.database_url, config.database_max_connections).await?;
    db.migrate().await?;

    let engine = Arc::new(
        Engine::connect(EngineSettings {
            network: config.workspace_network.clone(),
            image: config.workspace_image.clone(),
            stop_timeout: config.stop_timeout,
        })
        .await?,
    );
    engine
        .ensure_network()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to ensure internal network: {}", e))?;
    info!(network = %config.workspace_network, "Internal network ready");

    let tokens = TokenSigner::new(&config.token_secret, config.token_ttl_hours);
    let workspaces = Arc::new(WorkspaceManager::new(
        db.clone(),
        Arc::clone(&engine),
        config.max_workspaces_per_user,
    ));
    let payment_client = PaymentClient::new(
        &config.payment_api_base,
        &config.payment_key_id,
        &config.payment_key_secret,
    );
    let billing = Arc::new(Billing::new(
        db.clone(),
        Arc::clone(&workspaces),
        payment_client,
        config.payment_webhook_secret.clone(),
        config.payment_plan_id.clone(),
    ));
    let limiter = RateLimiter::new(config.rate_limits.clone());
    let proxy = ProxyGateway::new(
        db.clone(),
        Arc::clone(&engine),
        config.workspace_container_port,
        config.upstream_connect_timeout,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = Arc::new(AppState {
        config,
        db,
        tokens,
        workspaces,
        billing,
        limiter,
        proxy,
    });

    ApiServer::new(state, shutdown_rx).run().await
}
